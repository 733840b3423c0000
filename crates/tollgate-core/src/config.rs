//! Admission configuration
//!
//! Limits, wait tuning and output estimation settings for the admission
//! controller. Values are validated once when the controller is built and
//! are immutable afterwards.

use crate::error::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Embedded default configuration (compiled into the crate)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Environment variable prefix for overrides (`TOLLGATE_TOKEN_LIMIT`, ...)
pub const ENV_PREFIX: &str = "TOLLGATE";

/// How output tokens are estimated when the caller does not supply a figure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputEstimationStrategy {
    /// `ceil(input * output_multiplier)` output tokens
    FixedMultiplier,
    /// `default_output_tokens` output tokens
    FixedAmount,
    /// As many output tokens as input tokens
    Conservative,
}

impl Default for OutputEstimationStrategy {
    fn default() -> Self {
        Self::FixedMultiplier
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Tokens allowed per window
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,
    /// Sliding window length in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Headroom subtracted from `token_limit` to get the effective limit
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: u64,
    /// Maximum reservations outstanding at once
    #[serde(default = "default_max_concurrent_reservations")]
    pub max_concurrent_reservations: usize,
    /// Maximum admitted requests per rolling minute
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
    /// Lower bound for a single capacity wait
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,
    /// Upper bound for a single capacity wait
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Inflation applied to the computed expiry wait
    #[serde(default = "default_wait_time_multiplier")]
    pub wait_time_multiplier: f64,
    /// Random jitter range added to every wait, `[0, jitter_range_ms)`
    #[serde(default = "default_jitter_range_ms")]
    pub jitter_range_ms: u64,
    /// Waits allowed after the first capacity check before timing out
    #[serde(default = "default_max_wait_retries")]
    pub max_wait_retries: u32,
    /// Output estimation strategy
    #[serde(default)]
    pub output_strategy: OutputEstimationStrategy,
    /// Multiplier for [`OutputEstimationStrategy::FixedMultiplier`]
    #[serde(default = "default_output_multiplier")]
    pub output_multiplier: f64,
    /// Output tokens for [`OutputEstimationStrategy::FixedAmount`]
    #[serde(default = "default_output_tokens")]
    pub default_output_tokens: u64,
    /// Age after which an unfinalized reservation is treated as abandoned
    #[serde(default = "default_stale_reservation_secs")]
    pub stale_reservation_secs: u64,
    /// Minimum interval between opportunistic cleanup sweeps
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_token_limit() -> u64 {
    90_000
}

fn default_window_seconds() -> u64 {
    60
}

fn default_safety_buffer() -> u64 {
    5_000
}

fn default_max_concurrent_reservations() -> usize {
    10
}

fn default_max_requests_per_minute() -> u32 {
    3_500
}

fn default_min_wait_ms() -> u64 {
    100
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_wait_time_multiplier() -> f64 {
    1.2
}

fn default_jitter_range_ms() -> u64 {
    250
}

fn default_max_wait_retries() -> u32 {
    10
}

fn default_output_multiplier() -> f64 {
    1.0
}

fn default_output_tokens() -> u64 {
    1_000
}

fn default_stale_reservation_secs() -> u64 {
    600
}

fn default_cleanup_interval_secs() -> u64 {
    5
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            window_seconds: default_window_seconds(),
            safety_buffer: default_safety_buffer(),
            max_concurrent_reservations: default_max_concurrent_reservations(),
            max_requests_per_minute: default_max_requests_per_minute(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            wait_time_multiplier: default_wait_time_multiplier(),
            jitter_range_ms: default_jitter_range_ms(),
            max_wait_retries: default_max_wait_retries(),
            output_strategy: OutputEstimationStrategy::default(),
            output_multiplier: default_output_multiplier(),
            default_output_tokens: default_output_tokens(),
            stale_reservation_secs: default_stale_reservation_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl AdmissionConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration for a token limit per window
    #[must_use]
    pub fn with_limits(token_limit: u64, window_seconds: u64, safety_buffer: u64) -> Self {
        Self {
            token_limit,
            window_seconds,
            safety_buffer,
            ..Self::default()
        }
    }

    /// Set maximum outstanding reservations
    #[must_use]
    pub fn with_max_concurrent_reservations(mut self, max: usize) -> Self {
        self.max_concurrent_reservations = max;
        self
    }

    /// Set maximum admitted requests per minute
    #[must_use]
    pub fn with_max_requests_per_minute(mut self, max: u32) -> Self {
        self.max_requests_per_minute = max;
        self
    }

    /// Set wait bounds in milliseconds
    #[must_use]
    pub fn with_wait_bounds(mut self, min_wait_ms: u64, max_wait_ms: u64) -> Self {
        self.min_wait_ms = min_wait_ms;
        self.max_wait_ms = max_wait_ms;
        self
    }

    /// Set the wait inflation multiplier
    #[must_use]
    pub fn with_wait_time_multiplier(mut self, multiplier: f64) -> Self {
        self.wait_time_multiplier = multiplier;
        self
    }

    /// Set jitter range in milliseconds (0 disables jitter)
    #[must_use]
    pub fn with_jitter_range_ms(mut self, jitter_range_ms: u64) -> Self {
        self.jitter_range_ms = jitter_range_ms;
        self
    }

    /// Set the retry budget for capacity waits
    #[must_use]
    pub fn with_max_wait_retries(mut self, retries: u32) -> Self {
        self.max_wait_retries = retries;
        self
    }

    /// Set the output estimation strategy and its parameters
    #[must_use]
    pub fn with_output_estimation(
        mut self,
        strategy: OutputEstimationStrategy,
        output_multiplier: f64,
        default_output_tokens: u64,
    ) -> Self {
        self.output_strategy = strategy;
        self.output_multiplier = output_multiplier;
        self.default_output_tokens = default_output_tokens;
        self
    }

    /// Set the stale reservation horizon in seconds
    #[must_use]
    pub fn with_stale_reservation_secs(mut self, secs: u64) -> Self {
        self.stale_reservation_secs = secs;
        self
    }

    /// Set the cleanup sweep interval in seconds
    #[must_use]
    pub fn with_cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    /// Load configuration from embedded defaults, an optional file, and
    /// `TOLLGATE_*` environment variables (highest priority).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let loaded: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config("source", e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let parsed: Self = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config("source", e.to_string()))?;

        parsed.validate()?;
        Ok(parsed)
    }

    /// Check every invariant, failing on the first violation
    pub fn validate(&self) -> Result<()> {
        if self.token_limit == 0 {
            return Err(Error::config("token_limit", "must be greater than 0"));
        }
        if self.safety_buffer >= self.token_limit {
            return Err(Error::config(
                "safety_buffer",
                format!(
                    "must be less than token_limit ({} >= {})",
                    self.safety_buffer, self.token_limit
                ),
            ));
        }
        if self.window_seconds == 0 {
            return Err(Error::config("window_seconds", "must be greater than 0"));
        }
        if self.min_wait_ms == 0 {
            return Err(Error::config("min_wait_ms", "must be greater than 0"));
        }
        if self.min_wait_ms >= self.max_wait_ms {
            return Err(Error::config(
                "max_wait_ms",
                format!(
                    "must be greater than min_wait_ms ({} <= {})",
                    self.max_wait_ms, self.min_wait_ms
                ),
            ));
        }
        if self.max_concurrent_reservations == 0 {
            return Err(Error::config(
                "max_concurrent_reservations",
                "must be greater than 0",
            ));
        }
        if self.max_concurrent_reservations > Semaphore::MAX_PERMITS {
            return Err(Error::config(
                "max_concurrent_reservations",
                format!("must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.max_requests_per_minute == 0 {
            return Err(Error::config(
                "max_requests_per_minute",
                "must be greater than 0",
            ));
        }
        if !self.wait_time_multiplier.is_finite() || self.wait_time_multiplier <= 0.0 {
            return Err(Error::config(
                "wait_time_multiplier",
                "must be a positive finite number",
            ));
        }
        if !self.output_multiplier.is_finite() || self.output_multiplier < 0.0 {
            return Err(Error::config(
                "output_multiplier",
                "must be a non-negative finite number",
            ));
        }
        if self.max_wait_retries == 0 {
            return Err(Error::config("max_wait_retries", "must be greater than 0"));
        }
        if self.stale_reservation_secs == 0 {
            return Err(Error::config(
                "stale_reservation_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Real admission ceiling: `token_limit - safety_buffer`
    #[must_use]
    pub fn effective_limit(&self) -> u64 {
        self.token_limit.saturating_sub(self.safety_buffer)
    }

    /// Sliding window duration
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Stale reservation horizon
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_reservation_secs)
    }

    /// Cleanup sweep interval
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Total tokens to reserve for a request.
    ///
    /// A caller-supplied output estimate wins; otherwise the configured
    /// strategy fills in the output side.
    #[must_use]
    pub fn estimate_total(&self, input_tokens: u64, estimated_output_tokens: u64) -> u64 {
        if estimated_output_tokens > 0 {
            return input_tokens.saturating_add(estimated_output_tokens);
        }

        match self.output_strategy {
            OutputEstimationStrategy::FixedMultiplier => {
                let output = (input_tokens as f64 * self.output_multiplier).ceil() as u64;
                input_tokens.saturating_add(output)
            }
            OutputEstimationStrategy::FixedAmount => {
                input_tokens.saturating_add(self.default_output_tokens)
            }
            OutputEstimationStrategy::Conservative => input_tokens.saturating_mul(2),
        }
    }
}
