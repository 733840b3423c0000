//! Admission controller
//!
//! Reserves token capacity against a sliding-window token limit, a
//! requests-per-minute limit, and a bound on outstanding reservations.
//!
//! ## Usage
//!
//! ```ignore
//! let controller = AdmissionController::new(AdmissionConfig::default())?;
//!
//! let mut handle = controller.reserve(estimated_input, 0).await?;
//! let response = call_provider().await;
//! handle.record_actual_usage(response.usage.total_tokens);
//! handle.finalize().await;
//! ```
//!
//! Shared state is two locks: `usage` (recorded usage and admitted
//! requests) and `reservations` (the reservation table). Any path that
//! takes both takes `usage` first.

use crate::config::AdmissionConfig;
use crate::error::{Error, Result};
use crate::handle::ReservationHandle;
use crate::reservation::{Reservation, ReservationId, ReservationInfo, ReservationTable};
use crate::stats::UsageStats;
use crate::wait::WaitCalculator;
use crate::window::UsageState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of a capacity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capacity {
    /// Tokens and request rate both fit
    Available,
    /// The request would push usage past the effective limit.
    ///
    /// `historical_usage` is the recorded part of `current_usage`; only it
    /// ages out of the window.
    Tokens {
        current_usage: u64,
        historical_usage: u64,
        deficit: u64,
    },
    /// The requests-per-minute limit is reached
    Requests { retry_after: Duration },
}

/// State shared between the controller and its handles
#[derive(Debug)]
pub(crate) struct Shared {
    config: AdmissionConfig,
    wait: WaitCalculator,
    usage: RwLock<UsageState>,
    reservations: Mutex<ReservationTable>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    /// Detached finalize tasks from dropped handles
    finalizers: TaskTracker,
}

impl Shared {
    fn capacity(
        &self,
        usage: &UsageState,
        reserved: u64,
        requested: u64,
        now: Instant,
    ) -> Capacity {
        let historical_usage = usage.tokens.usage_at(now);
        let current_usage = historical_usage.saturating_add(reserved);
        let effective_limit = self.config.effective_limit();
        let projected = current_usage.saturating_add(requested);

        if projected > effective_limit {
            return Capacity::Tokens {
                current_usage,
                historical_usage,
                deficit: projected - effective_limit,
            };
        }

        if usage.requests.count_in_last_minute(now) >= self.config.max_requests_per_minute {
            return Capacity::Requests {
                retry_after: usage.requests.time_until_slot(now),
            };
        }

        Capacity::Available
    }

    /// Optimistic capacity check under shared access
    async fn check(&self, requested: u64) -> Capacity {
        let now = Instant::now();
        let usage = self.usage.read().await;
        let table = self.reservations.lock().await;
        self.capacity(&usage, table.total_reserved_tokens(), requested, now)
    }

    /// Re-check capacity and insert the reservation as one step
    async fn commit(
        &self,
        id: ReservationId,
        input_tokens: u64,
        requested: u64,
    ) -> std::result::Result<Reservation, Capacity> {
        let now = Instant::now();
        let mut usage = self.usage.write().await;
        let mut table = self.reservations.lock().await;
        usage.tokens.evict_expired(now);
        usage.requests.prune(now);

        let reservation = Reservation::new(id, input_tokens, requested);
        let mut outcome = Capacity::Available;
        let admitted = table.try_admit(reservation.clone(), |reserved| {
            outcome = self.capacity(&usage, reserved, requested, now);
            outcome == Capacity::Available
        });

        if !admitted {
            return Err(outcome);
        }

        usage.requests.record(now);
        Ok(reservation)
    }

    fn wait_time(&self, capacity: Capacity) -> Duration {
        match capacity {
            // Reservations never expire; only recorded usage frees capacity over time
            Capacity::Tokens {
                historical_usage,
                deficit,
                ..
            } => self.wait.token_wait(historical_usage, deficit),
            Capacity::Requests { retry_after } => self.wait.request_wait(retry_after),
            Capacity::Available => Duration::ZERO,
        }
    }

    /// Run a sweep if the cleanup interval has elapsed.
    ///
    /// Checks under the read lock first; the write path re-verifies.
    async fn maybe_cleanup(&self) {
        let now = Instant::now();
        {
            let usage = self.usage.read().await;
            if !usage.cleanup_due(now, self.config.cleanup_interval()) {
                return;
            }
        }
        self.sweep(now, false).await;
    }

    /// Evict expired usage and stale reservations, returning the number of
    /// reservations evicted. Each eviction gives its slot back.
    async fn sweep(&self, now: Instant, force: bool) -> usize {
        let stale = {
            let mut usage = self.usage.write().await;
            if !force && !usage.cleanup_due(now, self.config.cleanup_interval()) {
                return 0;
            }
            usage.sweep(now);

            let mut table = self.reservations.lock().await;
            table.evict_stale(now, self.config.stale_after())
        };

        for reservation in &stale {
            warn!(
                reservation_id = %reservation.id,
                reserved_tokens = reservation.reserved_tokens,
                age_secs = reservation.age(now).as_secs(),
                "Evicted stale reservation"
            );
        }
        if !stale.is_empty() {
            self.slots.add_permits(stale.len());
        }
        stale.len()
    }

    fn apply_release(
        usage: &mut UsageState,
        table: &mut ReservationTable,
        id: &ReservationId,
        actual_tokens: Option<u64>,
        now: Instant,
    ) -> Option<Reservation> {
        let removed = table.remove(id);
        if let Some(tokens) = actual_tokens {
            usage.tokens.record(tokens, now);
        }
        usage.tokens.evict_expired(now);
        removed
    }

    fn after_release(&self, id: &ReservationId, removed: Option<Reservation>, actual: Option<u64>) {
        match removed {
            Some(reservation) => {
                self.slots.add_permits(1);
                debug!(
                    reservation_id = %id,
                    reserved_tokens = reservation.reserved_tokens,
                    actual_tokens = ?actual,
                    "Reservation finalized"
                );
            }
            None => {
                debug!(
                    reservation_id = %id,
                    actual_tokens = ?actual,
                    "Reservation already evicted, slot not released again"
                );
            }
        }
    }

    /// Remove a reservation, record its actual usage, and free its slot
    pub(crate) async fn release(&self, id: ReservationId, actual_tokens: Option<u64>) {
        let now = Instant::now();
        let removed = {
            let mut usage = self.usage.write().await;
            let mut table = self.reservations.lock().await;
            Self::apply_release(&mut usage, &mut table, &id, actual_tokens, now)
        };
        self.after_release(&id, removed, actual_tokens);
    }

    /// Same as [`Shared::release`] for callers outside any runtime
    fn release_blocking(&self, id: ReservationId, actual_tokens: Option<u64>) {
        let now = Instant::now();
        let removed = {
            let mut usage = self.usage.blocking_write();
            let mut table = self.reservations.blocking_lock();
            Self::apply_release(&mut usage, &mut table, &id, actual_tokens, now)
        };
        self.after_release(&id, removed, actual_tokens);
    }

    /// Release without waiting.
    ///
    /// Inside a runtime the work runs as a tracked task that `shutdown`
    /// waits for; without one it runs inline.
    pub(crate) fn release_detached(self: &Arc<Self>, id: ReservationId, actual_tokens: Option<u64>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(self);
                self.finalizers.spawn_on(
                    async move { shared.release(id, actual_tokens).await },
                    &runtime,
                );
            }
            Err(_) => self.release_blocking(id, actual_tokens),
        }
    }
}

/// Admission controller for a rate-limited token budget.
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    /// Create a controller, validating the configuration first
    pub fn new(config: AdmissionConfig) -> Result<Self> {
        config.validate()?;

        info!(
            token_limit = config.token_limit,
            effective_limit = config.effective_limit(),
            window_seconds = config.window_seconds,
            max_concurrent_reservations = config.max_concurrent_reservations,
            max_requests_per_minute = config.max_requests_per_minute,
            "Admission controller created"
        );

        let now = Instant::now();
        Ok(Self {
            shared: Arc::new(Shared {
                wait: WaitCalculator::from_config(&config),
                usage: RwLock::new(UsageState::new(config.window(), now)),
                reservations: Mutex::new(ReservationTable::new()),
                slots: Arc::new(Semaphore::new(config.max_concurrent_reservations)),
                shutdown: CancellationToken::new(),
                finalizers: TaskTracker::new(),
                config,
            }),
        })
    }

    /// Create a controller from embedded defaults and `TOLLGATE_*` variables
    pub fn from_env() -> Result<Self> {
        Self::new(AdmissionConfig::load(None)?)
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    /// Whether [`AdmissionController::shutdown`] has been called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Free concurrency slots
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.shared.slots.available_permits()
    }

    /// Validate a request and compute the tokens to reserve
    fn admission_size(&self, input_tokens: u64, estimated_output_tokens: u64) -> Result<u64> {
        if self.is_shutdown() {
            return Err(Error::Disposed);
        }
        if input_tokens == 0 {
            return Err(Error::InvalidArgument(
                "input_tokens must be greater than 0".to_string(),
            ));
        }

        let requested = self
            .shared
            .config
            .estimate_total(input_tokens, estimated_output_tokens);
        let effective_limit = self.shared.config.effective_limit();
        if requested > effective_limit {
            // Can never fit; fail before taking a slot
            warn!(requested, effective_limit, "Request exceeds the effective limit");
            return Err(Error::CapacityTimeout {
                attempts: 0,
                requested,
            });
        }
        Ok(requested)
    }

    async fn acquire_slot(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let slots = Arc::clone(&self.shared.slots);
        tokio::select! {
            permit = slots.acquire_owned() => permit.map_err(|_| Error::Disposed),
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = self.shared.shutdown.cancelled() => Err(Error::Disposed),
        }
    }

    async fn pause(&self, wait: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            () = tokio::time::sleep(wait) => Ok(()),
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = self.shared.shutdown.cancelled() => Err(Error::Disposed),
        }
    }

    /// Reserve capacity for a request, waiting until it fits.
    ///
    /// `estimated_output_tokens == 0` lets the configured output estimation
    /// strategy fill in the output side. A total above the effective limit
    /// fails at once with [`Error::CapacityTimeout`] and `attempts == 0`.
    pub async fn reserve(
        &self,
        input_tokens: u64,
        estimated_output_tokens: u64,
    ) -> Result<ReservationHandle> {
        self.reserve_with_cancel(input_tokens, estimated_output_tokens, &CancellationToken::new())
            .await
    }

    /// Reserve capacity, giving up with [`Error::Cancelled`] when `cancel`
    /// fires. Dropping the returned future is also a cancellation; in both
    /// cases the concurrency slot is released and nothing is left in the
    /// reservation table.
    pub async fn reserve_with_cancel(
        &self,
        input_tokens: u64,
        estimated_output_tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<ReservationHandle> {
        let requested = self.admission_size(input_tokens, estimated_output_tokens)?;

        // Held until commit; any early return drops it and frees the slot
        let permit = self.acquire_slot(cancel).await?;
        debug!(requested, "Concurrency slot acquired");

        let id = Uuid::new_v4();
        let max_retries = self.shared.config.max_wait_retries;

        for attempt in 0..=max_retries {
            if self.is_shutdown() {
                return Err(Error::Disposed);
            }

            self.shared.maybe_cleanup().await;
            let mut capacity = self.shared.check(requested).await;

            if capacity == Capacity::Available {
                match self.shared.commit(id, input_tokens, requested).await {
                    Ok(reservation) => {
                        // The table entry owns the slot from here on
                        permit.forget();
                        debug!(
                            reservation_id = %id,
                            requested,
                            attempt,
                            "Reservation admitted"
                        );
                        return Ok(ReservationHandle::new(
                            Arc::clone(&self.shared),
                            &reservation,
                        ));
                    }
                    Err(lost) => {
                        warn!(attempt, requested, "Lost admission race, rechecking");
                        capacity = lost;
                    }
                }
            }

            if attempt == max_retries {
                break;
            }

            let wait = self.shared.wait_time(capacity);
            debug!(
                attempt,
                requested,
                wait_ms = wait.as_millis() as u64,
                capacity = ?capacity,
                "Waiting for capacity"
            );
            self.pause(wait, cancel).await?;
        }

        let attempts = max_retries.saturating_add(1);
        warn!(requested, attempts, "Capacity wait exhausted");
        Err(Error::CapacityTimeout {
            attempts,
            requested,
        })
    }

    /// Reserve only if a slot and capacity are available right now
    pub async fn try_reserve(
        &self,
        input_tokens: u64,
        estimated_output_tokens: u64,
    ) -> Result<ReservationHandle> {
        let requested = self.admission_size(input_tokens, estimated_output_tokens)?;
        let unavailable = Error::CapacityTimeout {
            attempts: 1,
            requested,
        };

        let permit = match Arc::clone(&self.shared.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(Error::Disposed),
            Err(TryAcquireError::NoPermits) => return Err(unavailable),
        };

        self.shared.maybe_cleanup().await;
        match self.shared.commit(Uuid::new_v4(), input_tokens, requested).await {
            Ok(reservation) => {
                permit.forget();
                debug!(reservation_id = %reservation.id, requested, "Reservation admitted");
                Ok(ReservationHandle::new(Arc::clone(&self.shared), &reservation))
            }
            Err(_) => Err(unavailable),
        }
    }

    /// Historical usage plus active reserved tokens
    pub async fn current_usage(&self) -> u64 {
        self.usage_stats().await.current_usage
    }

    /// Tokens actually consumed within the window
    pub async fn historical_usage(&self) -> u64 {
        self.shared.maybe_cleanup().await;
        let now = Instant::now();
        self.shared.usage.read().await.tokens.usage_at(now)
    }

    /// Tokens held by active reservations
    pub async fn reserved_tokens(&self) -> u64 {
        self.shared.reservations.lock().await.total_reserved_tokens()
    }

    /// Consistent usage snapshot
    pub async fn usage_stats(&self) -> UsageStats {
        self.shared.maybe_cleanup().await;

        let now = Instant::now();
        let usage = self.shared.usage.read().await;
        let table = self.shared.reservations.lock().await;

        let historical_usage = usage.tokens.usage_at(now);
        let reserved_tokens = table.total_reserved_tokens();
        let current_usage = historical_usage.saturating_add(reserved_tokens);
        let effective_limit = self.shared.config.effective_limit();

        UsageStats {
            current_usage,
            historical_usage,
            reserved_tokens,
            available_tokens: effective_limit.saturating_sub(current_usage),
            effective_limit,
            active_reservations: table.len(),
            requests_in_last_minute: usage.requests.count_in_last_minute(now),
            available_slots: self.shared.slots.available_permits(),
            taken_at: Utc::now(),
        }
    }

    /// Snapshot of active reservations, oldest first
    pub async fn active_reservations(&self) -> Vec<ReservationInfo> {
        let now = Instant::now();
        self.shared.reservations.lock().await.snapshot(now)
    }

    /// Force a sweep, returning the number of stale reservations evicted
    pub async fn evict_stale_reservations(&self) -> usize {
        self.shared.sweep(Instant::now(), true).await
    }

    /// Stop admitting reservations.
    ///
    /// Pending and future `reserve` calls fail with [`Error::Disposed`].
    /// Waits for finalize work from dropped handles. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!("Shutting down admission controller");
            self.shared.shutdown.cancel();
            self.shared.slots.close();
            self.shared.finalizers.close();
        }
        self.shared.finalizers.wait().await;
    }
}
