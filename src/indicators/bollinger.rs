use std::collections::VecDeque;

use super::moving_average::{calculate_sample_stdev, calculate_sma};
use crate::error::Error;

/// Band snapshot: `(middle, upper, lower)`, all `None` until the window fills
pub type BandValues = (Option<f64>, Option<f64>, Option<f64>);

/// Streaming Bollinger Bands
///
/// Keeps the last `period` values; once the window is full the middle band
/// is their mean and the outer bands sit `num_std_dev` sample standard
/// deviations away from it.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    period: usize,
    num_std_dev: f64,
    window: VecDeque<f64>,
    middle: Option<f64>,
    upper: Option<f64>,
    lower: Option<f64>,
}

impl BollingerBands {
    /// Create a calculator
    ///
    /// # Errors
    /// `InvalidIndicator` if `period` is zero, `num_std_dev` is negative, or
    /// `period < 2` with a non-zero width (sample stdev needs two points).
    pub fn new(period: usize, num_std_dev: f64) -> Result<Self, Error> {
        let invalid = period == 0
            || !num_std_dev.is_finite()
            || num_std_dev < 0.0
            || (period < 2 && num_std_dev > 0.0);
        if invalid {
            return Err(Error::InvalidIndicator {
                period,
                num_std_dev,
            });
        }

        Ok(Self {
            period,
            num_std_dev,
            window: VecDeque::with_capacity(period),
            middle: None,
            upper: None,
            lower: None,
        })
    }

    /// Push a value and recompute the bands
    pub fn update(&mut self, value: f64) -> BandValues {
        self.window.push_back(value);
        while self.window.len() > self.period {
            self.window.pop_front();
        }

        if self.window.len() == self.period {
            let values = self.window.make_contiguous();
            let middle = calculate_sma(values, self.period);
            let stdev = calculate_sample_stdev(values, self.period).unwrap_or(0.0);

            self.middle = middle;
            self.upper = middle.map(|m| m + self.num_std_dev * stdev);
            self.lower = middle.map(|m| m - self.num_std_dev * stdev);
        } else {
            self.middle = None;
            self.upper = None;
            self.lower = None;
        }

        self.bands()
    }

    pub fn bands(&self) -> BandValues {
        (self.middle, self.upper, self.lower)
    }

    pub fn middle_band(&self) -> Option<f64> {
        self.middle
    }

    pub fn upper_band(&self) -> Option<f64> {
        self.upper
    }

    pub fn lower_band(&self) -> Option<f64> {
        self.lower
    }

    pub fn is_ready(&self) -> bool {
        self.middle.is_some()
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.middle = None;
        self.upper = None;
        self.lower = None;
    }
}
