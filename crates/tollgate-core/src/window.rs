//! Sliding usage windows
//!
//! Tracks tokens actually consumed over the trailing token window, and
//! admitted requests over the trailing minute.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Window used for the requests-per-minute limit
pub(crate) const REQUEST_WINDOW: Duration = Duration::from_secs(60);

/// How long request buckets are retained (kept past the limit window)
pub(crate) const REQUEST_RETENTION: Duration = Duration::from_secs(120);

/// Width of a single request bucket
const REQUEST_BUCKET_WIDTH: Duration = Duration::from_secs(1);

/// Tokens actually consumed at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UsageEntry {
    pub(crate) timestamp: Instant,
    pub(crate) tokens: u64,
}

/// Time-ordered usage entries with a running total.
///
/// Entries are kept sorted by timestamp so expiry is always a prefix.
#[derive(Debug)]
pub(crate) struct UsageWindow {
    window: Duration,
    entries: VecDeque<UsageEntry>,
    /// Sum of `tokens` over `entries`
    total: u64,
}

impl UsageWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
            total: 0,
        }
    }

    /// Append a usage entry. Zero-token entries are not stored.
    pub(crate) fn record(&mut self, tokens: u64, at: Instant) {
        if tokens == 0 {
            return;
        }

        let entry = UsageEntry {
            timestamp: at,
            tokens,
        };
        match self.entries.back() {
            Some(last) if last.timestamp > at => {
                let pos = self.entries.partition_point(|e| e.timestamp <= at);
                self.entries.insert(pos, entry);
            }
            _ => self.entries.push_back(entry),
        }
        self.total = self.total.saturating_add(tokens);
    }

    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.window)
    }

    fn is_expired(entry: &UsageEntry, cutoff: Option<Instant>) -> bool {
        cutoff.is_some_and(|c| entry.timestamp < c)
    }

    /// Drop every entry older than `now - window`, returning evicted tokens
    pub(crate) fn evict_expired(&mut self, now: Instant) -> u64 {
        let cutoff = self.cutoff(now);
        let mut evicted = 0u64;

        while let Some(front) = self.entries.front() {
            if !Self::is_expired(front, cutoff) {
                break;
            }
            evicted = evicted.saturating_add(front.tokens);
            self.entries.pop_front();
        }

        self.total = self.total.saturating_sub(evicted);
        evicted
    }

    /// Usage inside the window, evicting expired entries first
    #[cfg(test)]
    pub(crate) fn historical_usage(&mut self, now: Instant) -> u64 {
        self.evict_expired(now);
        self.total
    }

    /// Usage inside the window without mutating (for shared readers)
    pub(crate) fn usage_at(&self, now: Instant) -> u64 {
        let cutoff = self.cutoff(now);
        let expired: u64 = self
            .entries
            .iter()
            .take_while(|e| Self::is_expired(e, cutoff))
            .map(|e| e.tokens)
            .sum();
        self.total.saturating_sub(expired)
    }

    /// Whether any entry has aged out and is waiting for eviction
    #[cfg(test)]
    pub(crate) fn has_expired(&self, now: Instant) -> bool {
        let cutoff = self.cutoff(now);
        self.entries
            .front()
            .is_some_and(|e| Self::is_expired(e, cutoff))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestBucket {
    started: Instant,
    last: Instant,
    count: u32,
}

/// Admitted-request counts in one-second buckets.
///
/// A bucket counts toward the last minute while its latest request does,
/// so boundary buckets are over- rather than under-counted.
#[derive(Debug, Default)]
pub(crate) struct RequestLog {
    buckets: VecDeque<RequestBucket>,
}

impl RequestLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record one admitted request
    pub(crate) fn record(&mut self, at: Instant) {
        self.prune(at);

        match self.buckets.back_mut() {
            Some(bucket)
                if at >= bucket.started && at.duration_since(bucket.started) < REQUEST_BUCKET_WIDTH =>
            {
                bucket.count = bucket.count.saturating_add(1);
                bucket.last = bucket.last.max(at);
            }
            _ => self.buckets.push_back(RequestBucket {
                started: at,
                last: at,
                count: 1,
            }),
        }
    }

    /// Drop buckets past the retention horizon
    pub(crate) fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(REQUEST_RETENTION) else {
            return;
        };
        while self.buckets.front().is_some_and(|b| b.last < cutoff) {
            self.buckets.pop_front();
        }
    }

    fn counts(bucket: &RequestBucket, cutoff: Option<Instant>) -> bool {
        cutoff.map_or(true, |c| bucket.last >= c)
    }

    /// Requests admitted within the trailing minute
    pub(crate) fn count_in_last_minute(&self, now: Instant) -> u32 {
        let cutoff = now.checked_sub(REQUEST_WINDOW);
        self.buckets
            .iter()
            .filter(|b| Self::counts(b, cutoff))
            .fold(0u32, |acc, b| acc.saturating_add(b.count))
    }

    /// Time until the oldest counted bucket leaves the minute window
    pub(crate) fn time_until_slot(&self, now: Instant) -> Duration {
        let cutoff = now.checked_sub(REQUEST_WINDOW);
        self.buckets
            .iter()
            .find(|b| Self::counts(b, cutoff))
            .map(|b| (b.last + REQUEST_WINDOW).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Usage accounting state shared by the controller
#[derive(Debug)]
pub(crate) struct UsageState {
    pub(crate) tokens: UsageWindow,
    pub(crate) requests: RequestLog,
    last_cleanup: Instant,
}

impl UsageState {
    pub(crate) fn new(window: Duration, now: Instant) -> Self {
        Self {
            tokens: UsageWindow::new(window),
            requests: RequestLog::new(),
            last_cleanup: now,
        }
    }

    /// Whether an opportunistic sweep should run now
    pub(crate) fn cleanup_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_cleanup) >= interval
    }

    /// Evict expired entries and mark the sweep time
    pub(crate) fn sweep(&mut self, now: Instant) -> u64 {
        self.last_cleanup = now;
        self.requests.prune(now);
        self.tokens.evict_expired(now)
    }
}
