//! MEXC spot order payloads and their mapping onto the canonical order model.
//!
//! Transport and request signing live outside this crate; this module only
//! understands what the venue sends back.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::{ExchangeError, ExchangeOrder, OrderStatus, Symbol};

/// Maps a MEXC order status onto the canonical vocabulary.
///
/// `PENDING_CANCEL` is treated as cancelled since the venue no longer works the
/// order. Unrecognised values fall back to `Pending` so the order stays eligible
/// for the next reconciliation pass instead of being finalised on a guess.
pub fn map_order_status(venue_status: &str) -> OrderStatus {
    match venue_status {
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "PENDING_CANCEL" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::Pending,
    }
}

/// MEXC returns order ids as strings on spot v3 but older payloads carry numbers.
fn deserialize_order_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OrderIdRepr {
        Text(String),
        Number(u64),
    }

    Ok(match OrderIdRepr::deserialize(deserializer)? {
        OrderIdRepr::Text(order_id) => order_id,
        OrderIdRepr::Number(order_id) => order_id.to_string(),
    })
}

/// Order query response from `GET /api/v3/order`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MexcOrder {
    #[serde(deserialize_with = "deserialize_order_id")]
    pub order_id: String,
    pub symbol: String,
    pub status: String,
    pub orig_qty: String,
    pub executed_qty: String,
    pub price: String,
    #[serde(default)]
    pub cummulative_quote_qty: Option<String>,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(value).map_err(|e| {
        ExchangeError::InvalidResponse(format!("field {field} is not a decimal ({value}): {e}"))
    })
}

impl MexcOrder {
    /// Volume-weighted fill price, derived from the cumulative quote amount when
    /// the venue provides it and from the limit price otherwise.
    pub fn average_price(&self) -> Result<Option<Decimal>, ExchangeError> {
        let executed_qty = parse_decimal("executedQty", &self.executed_qty)?;
        if executed_qty.is_zero() {
            return Ok(None);
        }

        match self.cummulative_quote_qty.as_deref() {
            Some(quote) => {
                let quote = parse_decimal("cummulativeQuoteQty", quote)?;
                Ok(Some(quote / executed_qty))
            }
            None => {
                let price = parse_decimal("price", &self.price)?;
                Ok((!price.is_zero()).then_some(price))
            }
        }
    }
}

/// Parses a raw order payload into the canonical order, keeping the payload as
/// the audit snapshot.
pub fn parse_order(raw: serde_json::Value) -> Result<ExchangeOrder, ExchangeError> {
    let order = MexcOrder::deserialize(&raw)
        .map_err(|e| ExchangeError::InvalidResponse(format!("order payload: {e}")))?;

    let executed_qty = parse_decimal("executedQty", &order.executed_qty)?;
    let avg_price = order.average_price()?;

    Ok(ExchangeOrder {
        status: map_order_status(&order.status),
        symbol: Symbol::new(order.symbol),
        order_id: order.order_id,
        executed_qty,
        avg_price,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_map_order_status() {
        assert_eq!(map_order_status("NEW"), OrderStatus::Pending);
        assert_eq!(map_order_status("PARTIALLY_FILLED"), OrderStatus::Partial);
        assert_eq!(map_order_status("FILLED"), OrderStatus::Filled);
        assert_eq!(map_order_status("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("PENDING_CANCEL"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(map_order_status("EXPIRED"), OrderStatus::Expired);
    }

    #[test]
    fn test_unknown_status_falls_back_to_pending() {
        assert_eq!(map_order_status("SOMETHING_NEW"), OrderStatus::Pending);
        assert_eq!(map_order_status("filled"), OrderStatus::Pending);
    }

    #[test]
    fn test_parse_filled_order_with_quote_quantity() {
        let raw = json!({
            "orderId": "C02__123",
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "origQty": "1.5",
            "executedQty": "1.5",
            "price": "45100",
            "cummulativeQuoteQty": "67500",
            "clientOrderId": "local-1"
        });

        let order = parse_order(raw.clone()).unwrap();

        assert_eq!(order.order_id, "C02__123");
        assert_eq!(order.symbol, Symbol::new("BTCUSDT"));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.executed_qty, dec!(1.5));
        assert_eq!(order.avg_price, Some(dec!(45000)));
        assert_eq!(order.raw, raw);
    }

    #[test]
    fn test_parse_numeric_order_id_and_limit_price_fallback() {
        let order = parse_order(json!({
            "orderId": 123,
            "symbol": "ETHUSDT",
            "status": "PARTIALLY_FILLED",
            "origQty": "2",
            "executedQty": "0.5",
            "price": "2500"
        }))
        .unwrap();

        assert_eq!(order.order_id, "123");
        assert_eq!(order.status, OrderStatus::Partial);
        assert_eq!(order.avg_price, Some(dec!(2500)));
    }

    #[test]
    fn test_unfilled_order_has_no_average_price() {
        let order = parse_order(json!({
            "orderId": "9",
            "symbol": "ETHUSDT",
            "status": "NEW",
            "origQty": "2",
            "executedQty": "0",
            "price": "1000",
            "cummulativeQuoteQty": "0"
        }))
        .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.executed_qty, dec!(0));
        assert_eq!(order.avg_price, None);
    }

    #[test]
    fn test_malformed_payload_is_invalid_response() {
        let missing_status = parse_order(json!({"orderId": "1", "symbol": "BTCUSDT"}));
        assert!(matches!(
            missing_status,
            Err(ExchangeError::InvalidResponse(_))
        ));

        let bad_quantity = parse_order(json!({
            "orderId": "1",
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "origQty": "1",
            "executedQty": "one",
            "price": "1"
        }));
        assert!(matches!(bad_quantity, Err(ExchangeError::InvalidResponse(_))));
    }
}
