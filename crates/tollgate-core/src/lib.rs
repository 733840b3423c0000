//! Tollgate Core - Admission control for LLM rate limits
//!
//! Callers reserve token capacity before calling a rate-limited API and
//! report what they actually used afterwards:
//! - Sliding-window accounting of actually-consumed tokens
//! - Reservation table holding estimated tokens of in-flight requests
//! - Admission gate bounding outstanding reservations and requests per minute
//! - Adaptive, jittered waits while capacity frees up
//!
//! The controller only deals in integer token counts; estimating tokens
//! from text is up to the caller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod handle;
pub mod reservation;
pub mod stats;
pub mod wait;

mod window;

pub use config::{AdmissionConfig, OutputEstimationStrategy};
pub use controller::AdmissionController;
pub use error::{Error, Result};
pub use handle::ReservationHandle;
pub use reservation::{ReservationId, ReservationInfo, ReservationState};
pub use stats::UsageStats;
pub use wait::WaitCalculator;

// Re-export for callers of `reserve_with_cancel`
pub use tokio_util::sync::CancellationToken;
