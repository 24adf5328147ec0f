#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use perpbot::execution::{OpenOrder, OrderGateway, OrderRequest};
use perpbot::models::{Candle, TimeUnit, Timeframe};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// What the strategy asked the gateway to do, in order
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    CancelAll(Option<String>),
    Place(OrderRequest),
}

/// Gateway double that records calls and keeps placed orders resting
pub struct RecordingGateway {
    pub history: Mutex<Vec<Candle>>,
    /// Signed live position for every coin asked about
    pub position: Mutex<Option<f64>>,
    pub calls: Mutex<Vec<GatewayCall>>,
    resting: Mutex<Vec<OpenOrder>>,
    next_oid: AtomicU64,
}

impl RecordingGateway {
    pub fn new(history: Vec<Candle>) -> Self {
        Self {
            history: Mutex::new(history),
            position: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            resting: Mutex::new(Vec::new()),
            next_oid: AtomicU64::new(1),
        }
    }

    pub fn set_position(&self, size: Option<f64>) {
        *self.position.lock().unwrap() = size;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Place(order) => Some(order),
                GatewayCall::CancelAll(_) => None,
            })
            .collect()
    }

    pub fn resting_count(&self) -> usize {
        self.resting.lock().unwrap().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl OrderGateway for RecordingGateway {
    async fn place_order(&self, order: &OrderRequest) -> bool {
        self.calls.lock().unwrap().push(GatewayCall::Place(order.clone()));
        if !order.is_valid() {
            return false;
        }

        self.resting.lock().unwrap().push(OpenOrder {
            coin: order.symbol.clone(),
            oid: self.next_oid.fetch_add(1, Ordering::SeqCst),
            side: if order.is_buy { "B".into() } else { "A".into() },
            limit_px: order.limit_price,
            sz: order.size,
            timestamp: 0,
        });
        true
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder> {
        self.resting
            .lock()
            .unwrap()
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.coin == s))
            .cloned()
            .collect()
    }

    async fn cancel_order(&self, _symbol: &str, oid: u64) -> bool {
        let mut resting = self.resting.lock().unwrap();
        let before = resting.len();
        resting.retain(|o| o.oid != oid);
        resting.len() < before
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        self.calls
            .lock()
            .unwrap()
            .push(GatewayCall::CancelAll(symbol.map(str::to_string)));

        let mut resting = self.resting.lock().unwrap();
        let before = resting.len();
        resting.retain(|o| symbol.is_some_and(|s| o.coin != s));
        before - resting.len()
    }

    async fn user_state(&self) -> Option<Value> {
        let positions = match *self.position.lock().unwrap() {
            Some(size) => vec![json!({
                "type": "oneWay",
                "position": {"coin": "ETH", "szi": size.to_string(), "entryPx": "2000.0", "unrealizedPnl": "0.0"}
            })],
            None => Vec::new(),
        };
        Some(json!({
            "marginSummary": {"accountValue": "100.0"},
            "assetPositions": positions
        }))
    }

    async fn recent_candles(
        &self,
        symbol: &str,
        _interval: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Vec<Candle> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.symbol == symbol)
            .cloned()
            .collect()
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Close of the `index`-th synthetic minute, strictly increasing
pub fn synthetic_close(index: i64) -> f64 {
    2000.0 + index as f64 * 0.5
}

/// The `index`-th one-minute ETH candle after `base_time`
pub fn minute_candle(index: i64) -> Candle {
    let start = base_time() + Duration::minutes(index);
    let close = synthetic_close(index);
    Candle {
        start_time: start,
        end_time: start + Duration::minutes(1) - Duration::milliseconds(1),
        symbol: "ETH".to_string(),
        timeframe: Timeframe::new(1, TimeUnit::Minute),
        open: close - 0.25,
        high: close + 0.5,
        low: close - 0.5,
        close,
        volume: 10.0,
        num_trades: 5,
    }
}

/// `candle` channel payload for a candle, numbers as strings like the venue
pub fn candle_payload(candle: &Candle) -> Value {
    json!({
        "t": candle.start_time.timestamp_millis(),
        "T": candle.end_time.timestamp_millis(),
        "s": candle.symbol,
        "i": candle.timeframe.to_string(),
        "o": candle.open.to_string(),
        "h": candle.high.to_string(),
        "l": candle.low.to_string(),
        "c": candle.close.to_string(),
        "v": candle.volume.to_string(),
        "n": candle.num_trades
    })
}

/// `userFills` payload with `(coin, side, size)` fills
pub fn fills_payload(is_snapshot: bool, fills: &[(&str, &str, f64)]) -> Value {
    let fills: Vec<Value> = fills
        .iter()
        .enumerate()
        .map(|(i, (coin, side, size))| {
            json!({
                "coin": coin,
                "px": "2000.0",
                "sz": size.to_string(),
                "side": side,
                "time": 1_704_067_200_000i64 + i as i64,
                "hash": "0x00",
                "oid": 100 + i as u64,
                "crossed": true,
                "fee": "0.01",
                "tid": 200 + i as u64,
                "feeToken": "USDC"
            })
        })
        .collect();

    json!({"isSnapshot": is_snapshot, "user": "0xabc", "fills": fills})
}
