// Multi-timeframe candle aggregation
pub mod aggregator;

pub use aggregator::{aggregate_candle, bucket_start, TimeframeAggregator};
