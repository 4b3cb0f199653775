use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use tracing::info;

use crate::{
    Balance, CancelAck, Exchange, ExchangeError, ExchangeOrder, OrderPlacement, OrderRequest,
    OrderStatus, OrderType, Side, SupportedExchange, Symbol,
};

/// Starting state for the simulated venue.
#[derive(Debug, Clone, Default)]
pub struct PaperConfig {
    pub balances: Vec<Balance>,
    /// Fill price for market orders, keyed by symbol.
    pub reference_prices: HashMap<Symbol, Decimal>,
}

impl PaperConfig {
    #[must_use]
    pub fn with_balance(mut self, asset: &str, free: Decimal) -> Self {
        self.balances.push(Balance {
            asset: asset.to_uppercase(),
            free,
            locked: Decimal::ZERO,
        });
        self
    }

    #[must_use]
    pub fn with_reference_price(mut self, symbol: &str, price: Decimal) -> Self {
        self.reference_prices.insert(Symbol::new(symbol), price);
        self
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: Symbol,
    side: Side,
    order_type: OrderType,
    quantity: Decimal,
    price: Option<Decimal>,
    status: OrderStatus,
    executed_qty: Decimal,
    quote_qty: Decimal,
    client_order_id: Option<String>,
}

impl PaperOrder {
    fn avg_price(&self) -> Option<Decimal> {
        (!self.executed_qty.is_zero()).then(|| self.quote_qty / self.executed_qty)
    }

    fn to_exchange_order(&self, order_id: &str) -> ExchangeOrder {
        let avg_price = self.avg_price();

        ExchangeOrder {
            order_id: order_id.to_string(),
            symbol: self.symbol.clone(),
            status: self.status,
            executed_qty: self.executed_qty,
            avg_price,
            raw: json!({
                "orderId": order_id,
                "symbol": self.symbol.0,
                "side": self.side.as_str(),
                "type": self.order_type.as_str(),
                "status": self.status.as_str(),
                "origQty": self.quantity.to_string(),
                "price": self.price.map(|price| price.to_string()),
                "executedQty": self.executed_qty.to_string(),
                "cummulativeQuoteQty": self.quote_qty.to_string(),
                "avgPrice": avg_price.map(|price| price.to_string()),
                "clientOrderId": self.client_order_id,
            }),
        }
    }
}

/// In-memory venue that simulates order handling without touching real funds.
///
/// Market orders fill immediately at the configured reference price, limit
/// orders rest until [`PaperExchange::simulate_fill`] executes them. Clones share
/// the same book.
#[derive(Debug, Clone)]
pub struct PaperExchange {
    order_counter: Arc<AtomicU64>,
    orders: Arc<Mutex<HashMap<String, PaperOrder>>>,
    balances: Arc<Mutex<HashMap<String, Balance>>>,
    reference_prices: Arc<HashMap<Symbol, Decimal>>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let balances = config
            .balances
            .into_iter()
            .map(|balance| (balance.asset.clone(), balance))
            .collect();

        Self {
            order_counter: Arc::new(AtomicU64::new(1)),
            orders: Arc::new(Mutex::new(HashMap::new())),
            balances: Arc::new(Mutex::new(balances)),
            reference_prices: Arc::new(config.reference_prices),
        }
    }

    fn generate_order_id(&self) -> String {
        let id = self.order_counter.fetch_add(1, Ordering::SeqCst);
        format!("PAPER_{id}")
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<String, PaperOrder>> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn balances(&self) -> MutexGuard<'_, HashMap<String, Balance>> {
        self.balances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a resting order under a caller-chosen id, as if it had been
    /// placed on the venue by another process.
    pub fn seed_order(&self, order_id: &str, symbol: Symbol, quantity: Decimal) {
        self.orders().insert(
            order_id.to_string(),
            PaperOrder {
                symbol,
                side: Side::Buy,
                order_type: OrderType::Limit,
                quantity,
                price: None,
                status: OrderStatus::Pending,
                executed_qty: Decimal::ZERO,
                quote_qty: Decimal::ZERO,
                client_order_id: None,
            },
        );
    }

    /// Executes `quantity` more of an open order at `price`.
    pub fn simulate_fill(
        &self,
        order_id: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut orders = self.orders();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        if order.status.is_terminal() {
            return Err(ExchangeError::InvalidOrder {
                reason: format!("order {order_id} is already {}", order.status),
            });
        }

        let executed_qty = order.executed_qty + quantity;
        if quantity <= Decimal::ZERO || executed_qty > order.quantity {
            return Err(ExchangeError::InvalidOrder {
                reason: format!(
                    "fill of {quantity} would take order {order_id} to {executed_qty} of {}",
                    order.quantity
                ),
            });
        }

        order.executed_qty = executed_qty;
        order.quote_qty += quantity * price;
        order.status = if executed_qty == order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };

        info!(
            "[PAPER] Filled {quantity} of order {order_id} at {price} ({executed_qty}/{})",
            order.quantity
        );

        Ok(order.to_exchange_order(order_id))
    }

    /// Forces an order into `status` without touching its executions, the way a
    /// venue expires or rejects orders on its own.
    pub fn simulate_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let mut orders = self.orders();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        info!("[PAPER] Order {order_id} moved {} -> {status}", order.status);
        order.status = status;

        Ok(order.to_exchange_order(order_id))
    }

    pub fn set_balance(&self, asset: &str, free: Decimal, locked: Decimal) {
        let asset = asset.to_uppercase();
        self.balances().insert(
            asset.clone(),
            Balance {
                asset,
                free,
                locked,
            },
        );
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new(PaperConfig::default())
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    type Config = PaperConfig;

    async fn try_from_config(config: Self::Config) -> Result<Self, ExchangeError> {
        info!(
            "[PAPER] Initializing paper venue with {} balances and {} reference prices",
            config.balances.len(),
            config.reference_prices.len()
        );
        Ok(Self::new(config))
    }

    async fn get_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrder, ExchangeError> {
        let orders = self.orders();
        let order = orders
            .get(order_id)
            .filter(|order| &order.symbol == symbol)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        Ok(order.to_exchange_order(order_id))
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderPlacement, ExchangeError> {
        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder {
                reason: format!("quantity must be positive, got {}", request.quantity),
            });
        }

        let (status, executed_qty, quote_qty) = match request.order_type {
            OrderType::Market => {
                let price = self
                    .reference_prices
                    .get(&request.symbol)
                    .copied()
                    .ok_or_else(|| ExchangeError::InvalidOrder {
                        reason: format!("no reference price for {}", request.symbol),
                    })?;
                (
                    OrderStatus::Filled,
                    request.quantity,
                    request.quantity * price,
                )
            }
            OrderType::Limit | OrderType::StopLossLimit if request.price.is_none() => {
                return Err(ExchangeError::InvalidOrder {
                    reason: format!("{} order requires a price", request.order_type),
                });
            }
            OrderType::Limit => (OrderStatus::New, Decimal::ZERO, Decimal::ZERO),
            OrderType::StopLoss | OrderType::StopLossLimit => {
                (OrderStatus::Pending, Decimal::ZERO, Decimal::ZERO)
            }
        };

        let order_id = self.generate_order_id();
        let order = PaperOrder {
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            status,
            executed_qty,
            quote_qty,
            client_order_id: request.client_order_id,
        };

        info!(
            "[PAPER] Placed {} {} order for {} {} (order_id: {order_id}, status: {status})",
            order.order_type, order.side, order.quantity, order.symbol
        );

        let placement = OrderPlacement {
            order_id: order_id.clone(),
            symbol: order.symbol.clone(),
            status,
            executed_qty,
            avg_price: order.avg_price(),
            placed_at: chrono::Utc::now(),
        };
        self.orders().insert(order_id, order);

        Ok(placement)
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<CancelAck, ExchangeError> {
        let mut orders = self.orders();
        let order = orders
            .get_mut(order_id)
            .filter(|order| &order.symbol == symbol)
            .ok_or_else(|| ExchangeError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        if order.status.is_terminal() {
            return Err(ExchangeError::InvalidOrder {
                reason: format!("order {order_id} is already {}", order.status),
            });
        }

        order.status = OrderStatus::Cancelled;
        info!("[PAPER] Cancelled order {order_id}");

        Ok(CancelAck {
            order_id: order_id.to_string(),
            status: OrderStatus::Cancelled,
        })
    }

    async fn get_balance(&self, asset: Option<&str>) -> Result<Vec<Balance>, ExchangeError> {
        let balances = self.balances();

        if let Some(asset) = asset {
            let asset = asset.to_uppercase();
            let balance = balances.get(&asset).cloned().unwrap_or(Balance {
                asset,
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
            });
            return Ok(vec![balance]);
        }

        let mut non_empty: Vec<Balance> = balances
            .values()
            .filter(|balance| !balance.total().is_zero())
            .cloned()
            .collect();
        non_empty.sort_by(|a, b| a.asset.cmp(&b.asset));

        Ok(non_empty)
    }

    fn to_supported_exchange(&self) -> SupportedExchange {
        SupportedExchange::Paper
    }
}
