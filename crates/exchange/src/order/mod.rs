use rust_decimal::Decimal;

pub mod status;

pub use status::OrderStatus;

/// Authoritative view of an order as reported by the venue, already mapped to
/// the canonical status vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: crate::Symbol,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    /// `None` until the venue reports at least one execution.
    pub avg_price: Option<Decimal>,
    /// Unmodified venue payload, kept for the audit trail.
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: crate::Symbol,
    pub side: crate::Side,
    pub order_type: crate::OrderType,
    pub quantity: Decimal,
    /// Required for limit orders, ignored for market orders.
    pub price: Option<Decimal>,
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderPlacement {
    pub order_id: String,
    pub symbol: crate::Symbol,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub placed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct CancelAck {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}
