//! Reconnect backoff policy
//!
//! `delay(n) = min(base * factor^n, max)`. Pure and deterministic.

use std::time::Duration;

/// Default delay before the first reconnect attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Default growth factor between attempts
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;
/// Default upper bound on any single delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            factor: DEFAULT_GROWTH_FACTOR,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self { base, factor, max }
    }

    /// Delay to wait before reconnect attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base.as_millis() as f64 * self.factor.powi(exponent);
        // NaN/inf from huge exponents collapse onto the cap
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}
