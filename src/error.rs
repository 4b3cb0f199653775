//! Domain-specific error types, one per layer of the reconciliation pipeline.
//! Venue failures, breaker rejections and database problems stay distinguishable
//! all the way up to the worker.

use reconciler_exchange::{
    ExchangeError, InvalidOrderTypeError, InvalidSideError, ParseOrderStatusError,
};
use rust_decimal::Decimal;

use crate::breaker::BreakerError;

/// Database persistence and data corruption errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid order status in database: {0}")]
    InvalidStatus(#[from] ParseOrderStatusError),
    #[error("Invalid order side in database: {0}")]
    InvalidSide(#[from] InvalidSideError),
    #[error("Invalid order type in database: {0}")]
    InvalidOrderType(#[from] InvalidOrderTypeError),
    #[error("Invalid decimal in column {column}: {value}")]
    InvalidDecimal { column: &'static str, value: String },
    #[error("Invalid exchange snapshot: {0}")]
    InvalidSnapshot(#[from] serde_json::Error),
    #[error("Order {0} not found")]
    OrderNotFound(i64),
}

/// Outcome of a guarded exchange call that did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("Circuit breaker {breaker} is open")]
    CircuitOpen { breaker: String },
    #[error("Circuit breaker {breaker} is half-open and at its trial call limit")]
    HalfOpenLimitExceeded { breaker: String },
    #[error("Transient exchange error: {0}")]
    Transient(ExchangeError),
    #[error("Fatal exchange error: {0}")]
    Fatal(ExchangeError),
}

impl CallError {
    /// Rejections issued by a breaker without contacting the venue.
    pub const fn is_breaker_signal(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } | Self::HalfOpenLimitExceeded { .. } => true,
            Self::Transient(_) | Self::Fatal(_) => false,
        }
    }

    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::CircuitOpen { .. } | Self::HalfOpenLimitExceeded { .. } | Self::Fatal(_) => {
                false
            }
        }
    }
}

impl From<ExchangeError> for CallError {
    fn from(error: ExchangeError) -> Self {
        if error.is_transient() {
            Self::Transient(error)
        } else {
            Self::Fatal(error)
        }
    }
}

impl From<BreakerError<ExchangeError>> for CallError {
    fn from(error: BreakerError<ExchangeError>) -> Self {
        match error {
            BreakerError::Open { breaker } => Self::CircuitOpen { breaker },
            BreakerError::HalfOpenLimitExceeded { breaker } => {
                Self::HalfOpenLimitExceeded { breaker }
            }
            BreakerError::Operation(error) => error.into(),
        }
    }
}

/// Failure to reconcile a single order. Never aborts the surrounding cycle.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error(
        "Exchange reports {executed_qty} executed for order {order_id} but only {quantity} was ordered"
    )]
    FillExceedsQuantity {
        order_id: i64,
        executed_qty: Decimal,
        quantity: Decimal,
    },
    #[error("Order {0} has not been submitted to the exchange")]
    NotSubmitted(i64),
}

impl ReconcileError {
    pub const fn is_breaker_signal(&self) -> bool {
        match self {
            Self::Call(error) => error.is_breaker_signal(),
            Self::Persistence(_) | Self::FillExceedsQuantity { .. } | Self::NotSubmitted(_) => {
                false
            }
        }
    }
}

/// Startup configuration rejected before any work begins.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{setting} must be greater than zero")]
    Zero { setting: &'static str },
    #[error("Retry initial delay ({initial_ms}ms) exceeds max delay ({max_ms}ms)")]
    RetryDelayOrder { initial_ms: u64, max_ms: u64 },
    #[error("Retry backoff multiplier must be a finite number >= 1, got {0}")]
    BackoffMultiplier(f32),
}
