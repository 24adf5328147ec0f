/// Calculate Simple Moving Average (SMA) over the last `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Sample standard deviation (n - 1 divisor) over the last `period` values
pub fn calculate_sample_stdev(values: &[f64], period: usize) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }

    let mean = calculate_sma(values, period)?;
    let sum_sq: f64 = values
        .iter()
        .rev()
        .take(period)
        .map(|v| (v - mean).powi(2))
        .sum();
    Some((sum_sq / (period - 1) as f64).sqrt())
}
