//! Adaptive wait-time calculation
//!
//! Estimates how long a blocked reservation should sleep before checking
//! capacity again, based on how fast recorded usage ages out of the window.

use crate::config::AdmissionConfig;
use rand::Rng;
use std::time::Duration;

/// Wait calculator derived from [`AdmissionConfig`]
#[derive(Debug, Clone)]
pub struct WaitCalculator {
    window_secs: f64,
    min_wait_ms: u64,
    max_wait_ms: u64,
    multiplier: f64,
    jitter_range_ms: u64,
}

impl WaitCalculator {
    /// Build from a validated configuration
    #[must_use]
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self {
            window_secs: config.window_seconds as f64,
            min_wait_ms: config.min_wait_ms,
            max_wait_ms: config.max_wait_ms,
            multiplier: config.wait_time_multiplier,
            jitter_range_ms: config.jitter_range_ms,
        }
    }

    /// Wait before jitter and clamping, in milliseconds.
    ///
    /// Usage is assumed to expire at `historical_usage / window` tokens per
    /// second; the wait is the time for `token_deficit` tokens to expire at
    /// that rate, inflated by the multiplier. With nothing expiring the
    /// fallback is twice the minimum wait.
    #[must_use]
    pub fn base_wait_ms(&self, historical_usage: u64, token_deficit: u64) -> u64 {
        let expiry_rate = historical_usage as f64 / self.window_secs;
        if expiry_rate > 0.0 {
            (token_deficit as f64 / expiry_rate * 1000.0 * self.multiplier).ceil() as u64
        } else {
            self.min_wait_ms.saturating_mul(2)
        }
    }

    /// Wait for a token deficit, with jitter, clamped to the bounds
    #[must_use]
    pub fn token_wait(&self, historical_usage: u64, token_deficit: u64) -> Duration {
        let base = self.base_wait_ms(historical_usage, token_deficit);
        self.finish(base)
    }

    /// Wait for a request-rate slot that frees up after `retry_after`
    #[must_use]
    pub fn request_wait(&self, retry_after: Duration) -> Duration {
        let base = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        self.finish(base)
    }

    fn finish(&self, base_ms: u64) -> Duration {
        let jittered = base_ms.saturating_add(self.jitter_ms());
        Duration::from_millis(self.clamp_ms(jittered))
    }

    /// Uniform jitter in `[0, jitter_range_ms)`
    fn jitter_ms(&self) -> u64 {
        if self.jitter_range_ms == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..self.jitter_range_ms)
    }

    fn clamp_ms(&self, ms: u64) -> u64 {
        ms.clamp(self.min_wait_ms, self.max_wait_ms)
    }
}
