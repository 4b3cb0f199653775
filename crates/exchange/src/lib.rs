use async_trait::async_trait;
use std::fmt::Display;

pub mod mexc;
pub mod order;
pub mod paper;

pub use order::status::ParseOrderStatusError;
pub use order::{Balance, CancelAck, ExchangeOrder, OrderPlacement, OrderRequest, OrderStatus};
pub use paper::{PaperConfig, PaperExchange};
pub use test::TestExchange;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into().to_uppercase())
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedExchange {
    Paper,
    Test,
}

impl Display for SupportedExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Test => write!(f, "test"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSideError(String);

impl std::fmt::Display for InvalidSideError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid side: {}", self.0)
    }
}

impl std::error::Error for InvalidSideError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = InvalidSideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            _ => Err(InvalidSideError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidOrderTypeError(String);

impl std::fmt::Display for InvalidOrderTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid order type: {}", self.0)
    }
}

impl std::error::Error for InvalidOrderTypeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossLimit,
}

impl OrderType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::StopLoss => "stop_loss",
            Self::StopLossLimit => "stop_loss_limit",
        }
    }
}

impl Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderType {
    type Err = InvalidOrderTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            "stop_loss" => Ok(Self::StopLoss),
            "stop_loss_limit" => Ok(Self::StopLossLimit),
            _ => Err(InvalidOrderTypeError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {operation}")]
    Timeout { operation: String },

    #[error("Rate limited: retry after {retry_after_seconds} seconds")]
    RateLimit { retry_after_seconds: u64 },

    #[error("Exchange unavailable: {message}")]
    Unavailable { message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("Invalid order: {reason}")]
    InvalidOrder { reason: String },

    #[error("Order placement failed: {0}")]
    OrderPlacement(String),

    #[error("Exchange initialization failed: {0}")]
    Initialization(String),

    #[error("Unexpected response from exchange: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    /// Whether retrying the same request could plausibly succeed.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::Timeout { .. }
            | Self::RateLimit { .. }
            | Self::Unavailable { .. } => true,
            Self::Authentication(_)
            | Self::OrderNotFound { .. }
            | Self::InvalidOrder { .. }
            | Self::OrderPlacement(_)
            | Self::Initialization(_)
            | Self::InvalidResponse(_) => false,
        }
    }
}

/// Boundary to a trading venue. Implementations own transport, signing, request
/// timeouts and the mapping of venue statuses onto [`OrderStatus`].
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    type Config: Send + Sync + Clone + 'static;

    /// Create and validate the exchange client from config.
    /// All initialization and credential checks happen here.
    async fn try_from_config(config: Self::Config) -> Result<Self, ExchangeError>
    where
        Self: Sized;

    async fn get_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrder, ExchangeError>;

    async fn place_order(&self, order: OrderRequest) -> Result<OrderPlacement, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol)
    -> Result<CancelAck, ExchangeError>;

    /// Balances for one asset, or every non-empty balance when `asset` is `None`.
    async fn get_balance(&self, asset: Option<&str>) -> Result<Vec<Balance>, ExchangeError>;

    fn to_supported_exchange(&self) -> SupportedExchange;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_is_uppercased() {
        assert_eq!(Symbol::new("btcusdt").to_string(), "BTCUSDT");
    }

    #[test]
    fn test_supported_exchange_display() {
        assert_eq!(SupportedExchange::Paper.to_string(), "paper");
        assert_eq!(SupportedExchange::Test.to_string(), "test");
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert_eq!(
            "BUY".parse::<Side>().unwrap_err(),
            InvalidSideError("BUY".to_string())
        );
    }

    #[test]
    fn test_order_type_parsing() {
        for order_type in [
            OrderType::Market,
            OrderType::Limit,
            OrderType::StopLoss,
            OrderType::StopLossLimit,
        ] {
            assert_eq!(order_type.as_str().parse::<OrderType>().unwrap(), order_type);
        }
        assert!("stop".parse::<OrderType>().is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(ExchangeError::Network("reset".to_string()).is_transient());
        assert!(
            ExchangeError::Timeout {
                operation: "get_order".to_string()
            }
            .is_transient()
        );
        assert!(
            ExchangeError::RateLimit {
                retry_after_seconds: 1
            }
            .is_transient()
        );
        assert!(
            ExchangeError::Unavailable {
                message: "502".to_string()
            }
            .is_transient()
        );

        assert!(!ExchangeError::Authentication("bad key".to_string()).is_transient());
        assert!(
            !ExchangeError::OrderNotFound {
                order_id: "1".to_string()
            }
            .is_transient()
        );
        assert!(
            !ExchangeError::InvalidOrder {
                reason: "qty".to_string()
            }
            .is_transient()
        );
        assert!(!ExchangeError::OrderPlacement("no funds".to_string()).is_transient());
        assert!(!ExchangeError::Initialization("down".to_string()).is_transient());
        assert!(!ExchangeError::InvalidResponse("garbage".to_string()).is_transient());
    }
}
