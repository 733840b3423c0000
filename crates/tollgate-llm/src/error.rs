//! Error types for tollgate-llm

use thiserror::Error;

/// Estimation error type
#[derive(Debug, Error)]
pub enum Error {
    /// Tokenizer encoding could not be loaded
    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),

    /// Characters-per-token ratio is not a positive finite number
    #[error("invalid characters-per-token ratio: {0}")]
    InvalidRatio(f64),

    /// Admission failed after estimation
    #[error(transparent)]
    Admission(#[from] tollgate_core::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
