//! Exponential backoff schedule

use rand::Rng;
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Exponential growth factor between retries
    pub backoff_multiplier: f64,
    /// Full jitter: pick a random delay in `[0, computed]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));

        if self.jitter && !capped.is_zero() {
            let millis = capped.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
        } else {
            capped
        }
    }
}
