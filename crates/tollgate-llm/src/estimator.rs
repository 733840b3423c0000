//! Token estimation
//!
//! Estimates are only used to size reservations; actual usage reported by
//! the provider replaces them on finalize.

use crate::error::{Error, Result};
use anyhow::Context;
use std::fmt;
use std::sync::LazyLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Tokens added per message for role markers and separators
const MESSAGE_OVERHEAD: u64 = 6;

/// Tokens added per conversation for start/end markers
const CONVERSATION_OVERHEAD: u64 = 3;

/// Default characters per token for [`CharRatioEstimator`]
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Shared cl100k_base encoding, loaded on first use
static TOKENIZER: LazyLock<std::result::Result<CoreBPE, String>> =
    LazyLock::new(|| load_tokenizer().map_err(|e| format!("{e:#}")));

fn load_tokenizer() -> anyhow::Result<CoreBPE> {
    cl100k_base().context("failed to load cl100k_base encoding")
}

/// Estimates the token count of a piece of text
#[cfg_attr(test, mockall::automock)]
pub trait Estimator: Send + Sync {
    /// Estimated tokens for `text`
    fn estimate(&self, text: &str) -> u64;
}

/// Token counter backed by tiktoken's cl100k_base encoding
#[derive(Clone, Copy)]
pub struct TiktokenEstimator {
    bpe: &'static CoreBPE,
}

impl TiktokenEstimator {
    /// Load the shared encoding. Only the first call pays the loading cost.
    pub fn new() -> Result<Self> {
        match &*TOKENIZER {
            Ok(bpe) => Ok(Self { bpe }),
            Err(message) => Err(Error::Tokenizer(message.clone())),
        }
    }

    /// Tokens for one chat message, including role overhead
    #[must_use]
    pub fn estimate_message(&self, content: &str) -> u64 {
        self.estimate(content) + MESSAGE_OVERHEAD
    }

    /// Tokens for a whole conversation
    #[must_use]
    pub fn estimate_conversation<S: AsRef<str>>(&self, messages: &[S]) -> u64 {
        messages
            .iter()
            .map(|m| self.estimate_message(m.as_ref()))
            .sum::<u64>()
            + CONVERSATION_OVERHEAD
    }
}

impl Estimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }
}

impl fmt::Debug for TiktokenEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiktokenEstimator")
            .field("encoding", &"cl100k_base")
            .finish()
    }
}

/// Tokenizer-free estimate: characters divided by a fixed ratio, rounded up
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Create with a custom characters-per-token ratio
    pub fn new(chars_per_token: f64) -> Result<Self> {
        if !chars_per_token.is_finite() || chars_per_token <= 0.0 {
            return Err(Error::InvalidRatio(chars_per_token));
        }
        Ok(Self { chars_per_token })
    }

    /// Characters per token
    #[must_use]
    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl Estimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count();
        (chars as f64 / self.chars_per_token).ceil() as u64
    }
}
