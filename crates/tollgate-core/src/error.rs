//! Error types for tollgate-core

use thiserror::Error;

/// Admission error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration violates an invariant (raised at construction time)
    #[error("invalid configuration: {field}: {message}")]
    Configuration {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Bad caller input, rejected before any state change
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Capacity did not free up within the retry budget
    #[error("capacity unavailable for {requested} tokens after {attempts} attempts")]
    CapacityTimeout {
        /// Number of capacity checks performed
        attempts: u32,
        /// Tokens that were requested
        requested: u64,
    },

    /// Caller cancelled the reservation while it was pending
    #[error("reservation cancelled")]
    Cancelled,

    /// Controller has been shut down
    #[error("admission controller has been shut down")]
    Disposed,
}

impl Error {
    pub(crate) fn config(field: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry the same request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityTimeout { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
