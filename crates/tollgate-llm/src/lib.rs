//! Tollgate LLM - Token estimation for admission control
//!
//! The admission controller only deals in token counts. This crate turns
//! prompt text into those counts:
//! - Estimator: the estimation capability
//! - TiktokenEstimator: cl100k_base token counting
//! - CharRatioEstimator: tokenizer-free character heuristic
//! - reserve_for_text: estimate, then reserve

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod error;
pub mod estimator;

pub use admission::{reserve_for_text, reserve_for_text_with_cancel};
pub use error::{Error, Result};
pub use estimator::{CharRatioEstimator, Estimator, TiktokenEstimator};
