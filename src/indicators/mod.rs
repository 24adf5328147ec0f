// Technical indicators module
// Streaming Bollinger Bands over a fixed window of closes

pub mod bollinger;
pub mod moving_average;

pub use bollinger::{BandValues, BollingerBands};
pub use moving_average::{calculate_sample_stdev, calculate_sma};
