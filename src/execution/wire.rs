use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::error::{Error, Result};

const WIRE_DECIMALS: u32 = 8;

/// Round to `decimals` places, ties to even
pub fn round_to(value: f64, decimals: u32) -> f64 {
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(decimals, RoundingStrategy::MidpointNearestEven))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}

/// Format a price or size the way the exchange expects
///
/// At most 8 decimals with trailing zeros trimmed. Values that would lose
/// precision at 8 decimals are rejected rather than silently truncated.
pub fn float_to_wire(value: f64) -> Result<String> {
    let decimal = Decimal::from_f64(value)
        .ok_or_else(|| Error::Parse(format!("not representable on the wire: {}", value)))?;
    let rounded = decimal.round_dp(WIRE_DECIMALS);

    let back = rounded.to_f64().unwrap_or(f64::NAN);
    if (back - value).abs() >= 1e-12 {
        return Err(Error::Parse(format!("float_to_wire causes rounding: {}", value)));
    }

    if rounded.is_zero() {
        return Ok("0".to_string());
    }
    Ok(rounded.normalize().to_string())
}

// ============== Action payloads ==============
//
// Field order is part of the signed hash; do not reorder.

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitWire {
    pub tif: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerWire {
    pub is_market: bool,
    pub trigger_px: String,
    pub tpsl: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderTypeWire {
    Limit(LimitWire),
    Trigger(TriggerWire),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderWire {
    #[serde(rename = "a")]
    pub asset: u32,
    #[serde(rename = "b")]
    pub is_buy: bool,
    #[serde(rename = "p")]
    pub limit_px: String,
    #[serde(rename = "s")]
    pub sz: String,
    #[serde(rename = "r")]
    pub reduce_only: bool,
    #[serde(rename = "t")]
    pub order_type: OrderTypeWire,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelWire {
    #[serde(rename = "a")]
    pub asset: u32,
    #[serde(rename = "o")]
    pub oid: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOrder {
    pub orders: Vec<OrderWire>,
    pub grouping: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkCancel {
    pub cancels: Vec<CancelWire>,
}

/// Signed exchange action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Order(BulkOrder),
    Cancel(BulkCancel),
}

impl Action {
    pub fn single_order(order: OrderWire) -> Self {
        Action::Order(BulkOrder {
            orders: vec![order],
            grouping: "na".to_string(),
        })
    }

    pub fn single_cancel(asset: u32, oid: u64) -> Self {
        Action::Cancel(BulkCancel {
            cancels: vec![CancelWire { asset, oid }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_float_to_wire_trims() {
        assert_eq!(float_to_wire(1960.5).unwrap(), "1960.5");
        assert_eq!(float_to_wire(0.0061).unwrap(), "0.0061");
        assert_eq!(float_to_wire(2000.0).unwrap(), "2000");
        assert_eq!(float_to_wire(0.0).unwrap(), "0");
        assert_eq!(float_to_wire(-0.0).unwrap(), "0");
    }

    #[test]
    fn test_float_to_wire_rejects_excess_precision() {
        assert!(float_to_wire(0.123456789).is_err());
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1960.26, 1), 1960.3);
        assert_eq!(round_to(0.00612345, 4), 0.0061);
        assert_eq!(round_to(2014.7, 0), 2015.0);
        assert_eq!(round_to(2.5, 0), 2.0);
    }

    #[test]
    fn test_order_action_json_shape() {
        let action = Action::single_order(OrderWire {
            asset: 4,
            is_buy: false,
            limit_px: "1900".into(),
            sz: "0.5".into(),
            reduce_only: true,
            order_type: OrderTypeWire::Trigger(TriggerWire {
                is_market: true,
                trigger_px: "1900".into(),
                tpsl: "sl".into(),
            }),
        });

        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({
                "type": "order",
                "orders": [{
                    "a": 4, "b": false, "p": "1900", "s": "0.5", "r": true,
                    "t": {"trigger": {"isMarket": true, "triggerPx": "1900", "tpsl": "sl"}}
                }],
                "grouping": "na"
            })
        );
    }

    #[test]
    fn test_cancel_action_json_shape() {
        let action = Action::single_cancel(1, 77);
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"type": "cancel", "cancels": [{"a": 1, "o": 77}]})
        );
    }
}
