//! Usage statistics snapshot

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time usage snapshot.
///
/// All figures are read under the same locks, so `current_usage` always
/// equals `historical_usage + reserved_tokens`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    /// Historical usage plus active reserved tokens
    pub current_usage: u64,
    /// Tokens actually consumed within the window
    pub historical_usage: u64,
    /// Tokens held by active reservations
    pub reserved_tokens: u64,
    /// `max(0, effective_limit - current_usage)`
    pub available_tokens: u64,
    /// `token_limit - safety_buffer`
    pub effective_limit: u64,
    /// Number of active reservations
    pub active_reservations: usize,
    /// Requests admitted in the trailing minute
    pub requests_in_last_minute: u32,
    /// Free concurrency slots
    pub available_slots: usize,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl UsageStats {
    /// Fraction of the effective limit in use (may exceed 1.0 only if the
    /// limit was exceeded through recorded actual usage)
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.effective_limit == 0 {
            return 0.0;
        }
        self.current_usage as f64 / self.effective_limit as f64
    }
}
