//! Reservation table
//!
//! Active reservations and the running total of tokens they hold. The
//! table itself has no locking; the controller owns it behind a mutex and
//! every method here runs under that exclusive borrow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Reservation identifier
pub type ReservationId = Uuid;

/// Lifecycle state of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Admitted and counted against the limit
    Active,
    /// Removed from the table
    Finalized,
}

/// A promise to consume up to `reserved_tokens` tokens
#[derive(Debug, Clone)]
pub(crate) struct Reservation {
    pub(crate) id: ReservationId,
    /// Input plus estimated output tokens
    pub(crate) reserved_tokens: u64,
    pub(crate) input_tokens: u64,
    pub(crate) created_at: Instant,
    pub(crate) created_at_utc: DateTime<Utc>,
    pub(crate) state: ReservationState,
}

impl Reservation {
    pub(crate) fn new(id: ReservationId, input_tokens: u64, reserved_tokens: u64) -> Self {
        Self {
            id,
            reserved_tokens,
            input_tokens,
            created_at: Instant::now(),
            created_at_utc: Utc::now(),
            state: ReservationState::Active,
        }
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub(crate) fn info(&self, now: Instant) -> ReservationInfo {
        ReservationInfo {
            id: self.id,
            reserved_tokens: self.reserved_tokens,
            input_tokens: self.input_tokens,
            created_at: self.created_at_utc,
            age_ms: self.age(now).as_millis() as u64,
            state: self.state,
        }
    }
}

/// Point-in-time view of an active reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationInfo {
    /// Reservation id
    pub id: ReservationId,
    /// Tokens held against the limit
    pub reserved_tokens: u64,
    /// Input tokens supplied by the caller
    pub input_tokens: u64,
    /// Wall-clock admission time
    pub created_at: DateTime<Utc>,
    /// Age at snapshot time in milliseconds
    pub age_ms: u64,
    /// Lifecycle state
    pub state: ReservationState,
}

/// Active reservations keyed by id
#[derive(Debug, Default)]
pub(crate) struct ReservationTable {
    active: HashMap<ReservationId, Reservation>,
    /// Sum of `reserved_tokens` over `active`
    total_reserved: u64,
}

impl ReservationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Evaluate capacity and insert in one step.
    ///
    /// `has_capacity` receives the current reserved total. The reservation
    /// is inserted only when it returns `true`.
    pub(crate) fn try_admit<F>(&mut self, reservation: Reservation, has_capacity: F) -> bool
    where
        F: FnOnce(u64) -> bool,
    {
        if self.active.contains_key(&reservation.id) || !has_capacity(self.total_reserved) {
            return false;
        }

        self.total_reserved = self.total_reserved.saturating_add(reservation.reserved_tokens);
        self.active.insert(reservation.id, reservation);
        self.debug_check();
        true
    }

    /// Remove a reservation. Removing an unknown id is a no-op.
    pub(crate) fn remove(&mut self, id: &ReservationId) -> Option<Reservation> {
        let mut reservation = self.active.remove(id)?;
        self.total_reserved = self
            .total_reserved
            .saturating_sub(reservation.reserved_tokens);
        reservation.state = ReservationState::Finalized;
        self.debug_check();
        Some(reservation)
    }

    /// Remove and return reservations older than `staleness`
    pub(crate) fn evict_stale(&mut self, now: Instant, staleness: Duration) -> Vec<Reservation> {
        let stale: Vec<ReservationId> = self
            .active
            .values()
            .filter(|r| r.age(now) > staleness)
            .map(|r| r.id)
            .collect();

        stale.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub(crate) fn total_reserved_tokens(&self) -> u64 {
        self.total_reserved
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &ReservationId) -> bool {
        self.active.contains_key(id)
    }

    /// Snapshot of active reservations, oldest first
    pub(crate) fn snapshot(&self, now: Instant) -> Vec<ReservationInfo> {
        let mut infos: Vec<_> = self.active.values().map(|r| r.info(now)).collect();
        infos.sort_by_key(|info| std::cmp::Reverse(info.age_ms));
        infos
    }

    fn debug_check(&self) {
        debug_assert_eq!(
            self.total_reserved,
            self.active.values().map(|r| r.reserved_tokens).sum::<u64>(),
            "reserved total out of sync with active reservations"
        );
    }
}
