use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, warn};

use super::wire::{float_to_wire, LimitWire, OrderTypeWire, OrderWire, TriggerWire};
use crate::error::Result;
use crate::models::Candle;

/// Time in force of a resting limit order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tif {
    /// Good till canceled
    Gtc,
    /// Immediate or cancel
    Ioc,
    /// Add liquidity only
    Alo,
}

impl Tif {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tif::Gtc => "Gtc",
            Tif::Ioc => "Ioc",
            Tif::Alo => "Alo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tpsl {
    StopLoss,
    TakeProfit,
}

impl Tpsl {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tpsl::StopLoss => "sl",
            Tpsl::TakeProfit => "tp",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderKind {
    Limit { tif: Tif },
    Trigger {
        trigger_px: f64,
        is_market: bool,
        tpsl: Tpsl,
    },
}

/// An order as the strategy wants it placed
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub is_buy: bool,
    pub size: f64,
    pub limit_price: f64,
    pub kind: OrderKind,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn limit(symbol: &str, is_buy: bool, size: f64, price: f64, tif: Tif) -> Self {
        Self {
            symbol: symbol.to_string(),
            is_buy,
            size,
            limit_price: price,
            kind: OrderKind::Limit { tif },
            reduce_only: false,
        }
    }

    /// Market-on-trigger protective order
    pub fn trigger(
        symbol: &str,
        is_buy: bool,
        size: f64,
        limit_price: f64,
        trigger_px: f64,
        tpsl: Tpsl,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            is_buy,
            size,
            limit_price,
            kind: OrderKind::Trigger {
                trigger_px,
                is_market: true,
                tpsl,
            },
            reduce_only: false,
        }
    }

    /// Both size and price must be strictly positive
    pub fn is_valid(&self) -> bool {
        let trigger_ok = match self.kind {
            OrderKind::Trigger { trigger_px, .. } => trigger_px > 0.0,
            OrderKind::Limit { .. } => true,
        };
        self.size > 0.0 && self.limit_price > 0.0 && trigger_ok
    }

    pub fn to_wire(&self, asset: u32) -> Result<OrderWire> {
        let order_type = match &self.kind {
            OrderKind::Limit { tif } => OrderTypeWire::Limit(LimitWire {
                tif: tif.as_str().to_string(),
            }),
            OrderKind::Trigger {
                trigger_px,
                is_market,
                tpsl,
            } => OrderTypeWire::Trigger(TriggerWire {
                is_market: *is_market,
                trigger_px: float_to_wire(*trigger_px)?,
                tpsl: tpsl.as_str().to_string(),
            }),
        };

        Ok(OrderWire {
            asset,
            is_buy: self.is_buy,
            limit_px: float_to_wire(self.limit_price)?,
            sz: float_to_wire(self.size)?,
            reduce_only: self.reduce_only,
            order_type,
        })
    }
}

/// A resting order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub coin: String,
    pub oid: u64,
    #[serde(default)]
    pub side: String,
    #[serde(default, deserialize_with = "de_str_f64")]
    pub limit_px: f64,
    #[serde(default, deserialize_with = "de_str_f64")]
    pub sz: f64,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

/// Open position in one coin; `size` is signed (negative = short)
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSummary {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub side: PositionSide,
}

impl PositionSummary {
    /// Find `symbol` in a clearinghouse state; `None` when absent or flat
    pub fn from_user_state(user_state: &Value, symbol: &str) -> Option<Self> {
        let positions = user_state.get("assetPositions")?.as_array()?;

        for entry in positions {
            let Some(position) = entry.get("position") else {
                continue;
            };
            if position.get("coin").and_then(Value::as_str) != Some(symbol) {
                continue;
            }

            let size = num_field(position, "szi");
            if size == 0.0 {
                return None;
            }

            let unrealized_pnl = match position.get("unrealizedPnl") {
                Some(v) if !v.is_null() => as_f64(v),
                _ => num_field(entry, "unrealizedPnl"),
            };

            return Some(Self {
                symbol: symbol.to_string(),
                size,
                entry_price: num_field(position, "entryPx"),
                unrealized_pnl,
                side: if size > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
            });
        }

        None
    }
}

/// Order placement, cancellation and account queries for one account
///
/// Remote failures are logged and turned into `false`/empty results so the
/// live pipeline keeps running; only setup problems surface as errors, and
/// those are raised when the gateway is built.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// `false` when the order was invalid or rejected
    async fn place_order(&self, order: &OrderRequest) -> bool;

    async fn open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder>;

    async fn cancel_order(&self, symbol: &str, oid: u64) -> bool;

    /// Clearinghouse state, `None` on failure
    async fn user_state(&self) -> Option<Value>;

    /// Input candles in `[start, end]`, oldest first; empty on failure
    async fn recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Candle>;

    /// Cancel every resting order, optionally for one coin only
    ///
    /// Returns how many were actually canceled; individual failures are
    /// logged and skipped.
    async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        let orders = self.open_orders(symbol).await;
        let mut canceled = 0;

        for order in &orders {
            if self.cancel_order(&order.coin, order.oid).await {
                canceled += 1;
            } else {
                warn!(coin = %order.coin, oid = order.oid, "Cancel failed");
            }
        }

        canceled
    }

    async fn get_position(&self, symbol: &str) -> Option<PositionSummary> {
        let state = self.user_state().await?;
        PositionSummary::from_user_state(&state, symbol)
    }

    /// `marginSummary.accountValue`, `None` when unavailable
    async fn account_value(&self) -> Option<f64> {
        let state = self.user_state().await?;
        match state.get("marginSummary").and_then(|m| m.get("accountValue")) {
            Some(v) => Some(as_f64(v)),
            None => {
                error!("User state without marginSummary");
                None
            }
        }
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn num_field(obj: &Value, key: &str) -> f64 {
    obj.get(key).map(as_f64).unwrap_or(0.0)
}

fn de_str_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(as_f64(&v))
}
