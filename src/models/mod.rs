use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Unit of a candle timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn suffix(&self) -> char {
        match self {
            TimeUnit::Second => 's',
            TimeUnit::Minute => 'm',
            TimeUnit::Hour => 'h',
            TimeUnit::Day => 'd',
        }
    }
}

impl TryFrom<char> for TimeUnit {
    type Error = Error;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            's' => Ok(TimeUnit::Second),
            'm' => Ok(TimeUnit::Minute),
            'h' => Ok(TimeUnit::Hour),
            'd' => Ok(TimeUnit::Day),
            other => Err(Error::UnsupportedTimeUnit(other.to_string())),
        }
    }
}

/// Candle timeframe, e.g. `1m`, `15m`, `1h`, `1d`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    pub period: u32,
    pub unit: TimeUnit,
}

impl Timeframe {
    pub fn new(period: u32, unit: TimeUnit) -> Self {
        Self { period, unit }
    }

    /// Length of one bucket
    pub fn duration(&self) -> Duration {
        let n = self.period as i64;
        match self.unit {
            TimeUnit::Second => Duration::seconds(n),
            TimeUnit::Minute => Duration::minutes(n),
            TimeUnit::Hour => Duration::hours(n),
            TimeUnit::Day => Duration::days(n),
        }
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unit_char = s
            .chars()
            .last()
            .ok_or_else(|| Error::Parse("empty interval".to_string()))?;
        let unit = TimeUnit::try_from(unit_char)?;
        let period: u32 = s[..s.len() - unit_char.len_utf8()]
            .parse()
            .map_err(|_| Error::Parse(format!("bad interval period: {}", s)))?;
        if period == 0 {
            return Err(Error::Parse(format!("interval period must be positive: {}", s)));
        }
        Ok(Timeframe { period, unit })
    }
}

impl TryFrom<String> for Timeframe {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.period, self.unit.suffix())
    }
}

/// OHLCV candle for a fixed time bucket
///
/// `end_time` is the last millisecond inside the bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub num_trades: u64,
}

impl Candle {
    pub fn from_message(msg: &CandleMessage) -> Result<Self, Error> {
        Ok(Candle {
            start_time: ms_to_datetime(msg.start_ms)?,
            end_time: ms_to_datetime(msg.end_ms)?,
            symbol: msg.symbol.clone(),
            timeframe: msg.interval.parse()?,
            open: msg.open,
            high: msg.high,
            low: msg.low,
            close: msg.close,
            volume: msg.volume,
            num_trades: msg.num_trades,
        })
    }
}

/// Trade direction; the venue encodes buys as `B` (bid) and sells as `A` (ask)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "B")]
    Buy,
    #[serde(rename = "A")]
    Sell,
}

impl Side {
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Buy)
    }
}

/// One execution of one of our orders. Immutable, delivered once.
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub time: DateTime<Utc>,
    pub hash: String,
    pub oid: u64,
    pub crossed: bool,
    pub fee: f64,
    pub tid: u64,
    pub liquidation: bool,
    pub fee_token: String,
    pub builder_fee: Option<f64>,
}

impl FillEvent {
    pub fn from_message(msg: &FillMessage) -> Result<Self, Error> {
        Ok(FillEvent {
            symbol: msg.coin.clone(),
            price: msg.px,
            size: msg.sz,
            side: msg.side,
            time: ms_to_datetime(msg.time)?,
            hash: msg.hash.clone(),
            oid: msg.oid,
            crossed: msg.crossed,
            fee: msg.fee,
            tid: msg.tid,
            liquidation: msg.liquidation.as_ref().is_some_and(|v| !v.is_null()),
            fee_token: msg.fee_token.clone(),
            builder_fee: msg.builder_fee,
        })
    }

    /// Size signed by side: buys positive, sells negative
    pub fn signed_quantity(&self) -> f64 {
        match self.side {
            Side::Buy => self.size,
            Side::Sell => -self.size,
        }
    }
}

// ============== Wire Types ==============

/// `candle` channel payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleMessage {
    #[serde(rename = "t")]
    pub start_ms: i64,
    #[serde(rename = "T")]
    pub end_ms: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o", deserialize_with = "de_num")]
    pub open: f64,
    #[serde(rename = "h", deserialize_with = "de_num")]
    pub high: f64,
    #[serde(rename = "l", deserialize_with = "de_num")]
    pub low: f64,
    #[serde(rename = "c", deserialize_with = "de_num")]
    pub close: f64,
    #[serde(rename = "v", deserialize_with = "de_num")]
    pub volume: f64,
    #[serde(rename = "n")]
    pub num_trades: u64,
}

/// One entry of the `userFills` channel's `fills` array
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillMessage {
    pub coin: String,
    #[serde(deserialize_with = "de_num")]
    pub px: f64,
    #[serde(deserialize_with = "de_num")]
    pub sz: f64,
    pub side: Side,
    pub time: i64,
    #[serde(default)]
    pub hash: String,
    pub oid: u64,
    #[serde(default)]
    pub crossed: bool,
    #[serde(default, deserialize_with = "de_num")]
    pub fee: f64,
    #[serde(default)]
    pub tid: u64,
    #[serde(default)]
    pub liquidation: Option<serde_json::Value>,
    #[serde(default)]
    pub fee_token: String,
    #[serde(default, deserialize_with = "de_opt_num")]
    pub builder_fee: Option<f64>,
}

/// `userFills` channel payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFillsMessage {
    #[serde(default)]
    pub is_snapshot: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub fills: Vec<FillMessage>,
}

pub fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>, Error> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Parse(format!("timestamp out of range: {}", ms)))
}

/// The venue sends most numbers as decimal strings; accept both forms.
fn de_num<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_num<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
        Some(serde_json::Value::String(s)) => {
            s.trim().parse().map(Some).map_err(serde::de::Error::custom)
        }
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number, got {}",
            other
        ))),
    }
}
