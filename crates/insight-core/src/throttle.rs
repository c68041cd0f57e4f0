//! Randomised pacing between requests.
//!
//! Every wait the scraper performs (between insight pages, between tokens,
//! after navigation) is drawn uniformly from a [`DelayRange`] so request
//! timing never settles into a detectable rhythm.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use insight_core::throttle::DelayRange;
//!
//! let range = DelayRange::from_secs_f64(8.0, 15.0).unwrap();
//! let d = range.sample();
//! assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(15));
//! ```

use std::time::Duration;

use rand::Rng;

use crate::error::AppError;

/// Inclusive `[min, max]` range a wait duration is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    /// Create a range, rejecting `min > max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self, AppError> {
        if min > max {
            return Err(AppError::ConfigError(format!(
                "delay range min ({}ms) exceeds max ({}ms)",
                min.as_millis(),
                max.as_millis()
            )));
        }
        Ok(Self { min, max })
    }

    pub fn from_secs_f64(min: f64, max: f64) -> Result<Self, AppError> {
        if !min.is_finite() || !max.is_finite() || min < 0.0 || max < 0.0 {
            return Err(AppError::ConfigError(format!(
                "delay range bounds must be non-negative seconds, got {min}..{max}"
            )));
        }
        Self::new(Duration::from_secs_f64(min), Duration::from_secs_f64(max))
    }

    /// A range that never waits.
    pub const fn zero() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// A range that always yields exactly `d`.
    pub const fn fixed(d: Duration) -> Self {
        Self { min: d, max: d }
    }

    /// Draw a duration uniformly from the range.
    pub fn sample(&self) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }
}

/// Sleep for `delay`, skipping the timer entirely for zero durations.
pub async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
