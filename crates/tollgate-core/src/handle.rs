//! Reservation handle
//!
//! Caller-side view of a granted reservation. Finalizing removes the
//! reservation, books any recorded usage, and frees the concurrency slot.
//! A handle dropped without finalizing is released in the background as if
//! no usage had been recorded.

use crate::controller::Shared;
use crate::reservation::{Reservation, ReservationId};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// A granted reservation
pub struct ReservationHandle {
    shared: Arc<Shared>,
    id: ReservationId,
    reserved_tokens: u64,
    input_tokens: u64,
    created_at: Instant,
    actual_tokens: Option<u64>,
    finalized: bool,
}

impl ReservationHandle {
    pub(crate) fn new(shared: Arc<Shared>, reservation: &Reservation) -> Self {
        Self {
            shared,
            id: reservation.id,
            reserved_tokens: reservation.reserved_tokens,
            input_tokens: reservation.input_tokens,
            created_at: reservation.created_at,
            actual_tokens: None,
            finalized: false,
        }
    }

    /// Reservation id
    #[must_use]
    pub fn id(&self) -> ReservationId {
        self.id
    }

    /// Tokens held against the limit (input plus estimated output)
    #[must_use]
    pub fn reserved_tokens(&self) -> u64 {
        self.reserved_tokens
    }

    /// Input tokens supplied at reservation time
    #[must_use]
    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    /// Output tokens included in the reservation
    #[must_use]
    pub fn estimated_output_tokens(&self) -> u64 {
        self.reserved_tokens.saturating_sub(self.input_tokens)
    }

    /// Admission time
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Usage recorded so far, if any
    #[must_use]
    pub fn actual_tokens(&self) -> Option<u64> {
        self.actual_tokens
    }

    /// Whether the handle has been finalized
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Record the tokens the request actually consumed.
    ///
    /// Booked into the usage window on finalize. Recording again replaces
    /// the previous figure. Ignored once the handle is finalized.
    pub fn record_actual_usage(&mut self, tokens: u64) {
        if self.finalized {
            debug!(
                reservation_id = %self.id,
                tokens,
                "Usage recorded after finalize, ignoring"
            );
            return;
        }
        self.actual_tokens = Some(tokens);
    }

    /// Finalize and wait for the release to complete. No-op when already
    /// finalized.
    pub async fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.shared.release(self.id, self.actual_tokens).await;
        // Set only after release ran, so a cancelled finalize falls back to Drop
        self.finalized = true;
    }

    /// Finalize without waiting. No-op when already finalized.
    pub fn finalize_detached(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.shared.release_detached(self.id, self.actual_tokens);
    }
}

impl Drop for ReservationHandle {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.shared.release_detached(self.id, None);
    }
}

impl fmt::Debug for ReservationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationHandle")
            .field("id", &self.id)
            .field("reserved_tokens", &self.reserved_tokens)
            .field("input_tokens", &self.input_tokens)
            .field("actual_tokens", &self.actual_tokens)
            .field("finalized", &self.finalized)
            .finish()
    }
}
