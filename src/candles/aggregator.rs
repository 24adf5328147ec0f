use chrono::{DateTime, Duration, Timelike, Utc};

use crate::error::Error;
use crate::models::{Candle, TimeUnit, Timeframe};

/// Smallest time step of a candle timestamp
fn tick() -> Duration {
    Duration::milliseconds(1)
}

/// Floor a timestamp to the start of its target bucket
///
/// Seconds, minutes and hours are floored by their period within the
/// enclosing minute, hour and day respectively. Days floor to midnight.
pub fn bucket_start(ts: DateTime<Utc>, target: Timeframe) -> DateTime<Utc> {
    let p = target.period as i64;
    let (h, m, s) = (ts.hour() as i64, ts.minute() as i64, ts.second() as i64);
    let sub_ms = ts.timestamp_subsec_millis() as i64;

    let offset_ms = match target.unit {
        TimeUnit::Second => (s % p) * 1000 + sub_ms,
        TimeUnit::Minute => ((m % p) * 60 + s) * 1000 + sub_ms,
        TimeUnit::Hour => ((h % p) * 3600 + m * 60 + s) * 1000 + sub_ms,
        TimeUnit::Day => (h * 3600 + m * 60 + s) * 1000 + sub_ms,
    };

    ts - Duration::milliseconds(offset_ms)
}

/// Fold a smaller candle into the aggregate for a larger timeframe
///
/// Returns `(is_complete, updated_aggregate)`. A stale aggregate whose end
/// precedes the new candle's bucket is discarded and a fresh one started.
pub fn aggregate_candle(
    new_candle: &Candle,
    current: Option<Candle>,
    target: Timeframe,
) -> (bool, Candle) {
    let start = bucket_start(new_candle.start_time, target);

    let current = current.filter(|agg| start <= agg.end_time);

    let mut agg = current.unwrap_or_else(|| Candle {
        start_time: start,
        end_time: start + target.duration() - tick(),
        symbol: new_candle.symbol.clone(),
        timeframe: target,
        open: new_candle.open,
        high: new_candle.high,
        low: new_candle.low,
        close: new_candle.close,
        volume: 0.0,
        num_trades: 0,
    });

    agg.high = agg.high.max(new_candle.high);
    agg.low = agg.low.min(new_candle.low);
    agg.close = new_candle.close;
    agg.volume += new_candle.volume;
    agg.num_trades += new_candle.num_trades;

    let is_complete = new_candle.end_time >= agg.end_time;
    (is_complete, agg)
}

/// Stateful wrapper holding the aggregate currently being built
#[derive(Debug, Clone)]
pub struct TimeframeAggregator {
    target: Timeframe,
    current: Option<Candle>,
}

impl TimeframeAggregator {
    pub fn new(target: Timeframe) -> Self {
        Self {
            target,
            current: None,
        }
    }

    /// Build from an interval string such as `"1h"`
    ///
    /// An unsupported unit is a configuration error.
    pub fn from_interval(interval: &str) -> Result<Self, Error> {
        Ok(Self::new(interval.parse()?))
    }

    pub fn target(&self) -> Timeframe {
        self.target
    }

    /// Feed one input candle; returns the aggregate when it completes
    pub fn push(&mut self, candle: &Candle) -> Option<Candle> {
        let (is_complete, agg) = aggregate_candle(candle, self.current.take(), self.target);
        let completed = is_complete.then(|| agg.clone());
        self.current = Some(agg);
        completed
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
