//! Error types for the metrics collector
//!
//! Every failure on the telemetry path is contained inside the collector. The
//! types here exist so the aggregator and uploader can report *what* went
//! wrong to logs and counters; none of them is ever surfaced to agent code
//! through the facade methods.
//!
//! # Error Categories
//!
//! - **Lifecycle** - `AlreadyInitialized`, `NotInitialized`
//! - **Recording** - `InvalidSession`, `UnknownTarget`, `UnknownSpan`, `SpanClosed`
//! - **Delivery** - `TransmissionFailure`, `BufferOverflow`
//! - **Setup** - `Configuration`, `Serialization`
//!
//! Out-of-range scores are not errors: they are stored clamped and flagged
//! (see [`crate::record::Score::clamped`]).
//!
//! # Retry Policy
//!
//! [`RetryConfig`] drives the uploader's bounded exponential backoff:
//!
//! ```rust
//! use convo_metrics::error::RetryConfig;
//!
//! let config = RetryConfig {
//!     max_retries: 3,
//!     base_delay_ms: 100,
//!     exponential_backoff: true,
//!     max_delay_ms: 2_000,
//!     jitter_factor: 0.0,
//! };
//!
//! assert_eq!(config.calculate_delay(1), 100);
//! assert_eq!(config.calculate_delay(3), 400);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the collector
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    /// The session is unknown for this operation, already finished, or the
    /// collector is running in no-op mode
    #[error("Invalid session: {session_id}")]
    InvalidSession { session_id: String },

    /// A score target resolved to neither a span nor a session
    #[error("Unknown score target: {target}")]
    UnknownTarget { target: String },

    /// The span id does not belong to any live session
    #[error("Unknown span: {span_id}")]
    UnknownSpan { span_id: String },

    /// The span was already closed
    #[error("Span already closed: {span_id}")]
    SpanClosed { span_id: String },

    /// A score scale with non-finite bounds
    #[error("Invalid score scale: {message}")]
    InvalidScale { message: String },

    /// The process-wide collector was initialized twice
    #[error("Metrics collector already initialized")]
    AlreadyInitialized,

    /// The process-wide collector was used before initialization in strict mode
    #[error("Metrics collector not initialized")]
    NotInitialized,

    /// A batch could not be delivered to the backend after all retries
    #[error("Transmission failure after {attempts} attempt(s): {message}")]
    TransmissionFailure { attempts: u32, message: String },

    /// A record was dropped because the buffer was full
    #[error("Buffer overflow: {dropped} record(s) dropped")]
    BufferOverflow { dropped: u64 },

    /// Invalid or unusable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// JSON serialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl MetricsError {
    /// Create an InvalidSession error
    pub fn invalid_session(session_id: impl Into<String>) -> Self {
        Self::InvalidSession {
            session_id: session_id.into(),
        }
    }

    /// Create an UnknownTarget error
    pub fn unknown_target(target: impl Into<String>) -> Self {
        Self::UnknownTarget {
            target: target.into(),
        }
    }

    /// Create an UnknownSpan error
    pub fn unknown_span(span_id: impl ToString) -> Self {
        Self::UnknownSpan {
            span_id: span_id.to_string(),
        }
    }

    /// Create a SpanClosed error
    pub fn span_closed(span_id: impl ToString) -> Self {
        Self::SpanClosed {
            span_id: span_id.to_string(),
        }
    }

    /// Create an InvalidScale error
    pub fn invalid_scale(message: impl Into<String>) -> Self {
        Self::InvalidScale {
            message: message.into(),
        }
    }

    /// Create a TransmissionFailure error
    pub fn transmission_failure(attempts: u32, message: impl Into<String>) -> Self {
        Self::TransmissionFailure {
            attempts,
            message: message.into(),
        }
    }

    /// Create a Configuration error
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a Serialization error
    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether this error concerns the collector lifecycle rather than a record
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            MetricsError::AlreadyInitialized | MetricsError::NotInitialized
        )
    }

    /// Whether retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetricsError::TransmissionFailure { .. })
    }
}

impl From<serde_json::Error> for MetricsError {
    fn from(err: serde_json::Error) -> Self {
        MetricsError::serialization_error(err.to_string())
    }
}

impl From<crate::config::ConfigError> for MetricsError {
    fn from(err: crate::config::ConfigError) -> Self {
        MetricsError::configuration_error(err.to_string())
    }
}

/// Retry configuration for batch delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Whether to use exponential backoff
    #[serde(default = "default_exponential_backoff")]
    pub exponential_backoff: bool,
    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) to add randomness to delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            exponential_backoff: default_exponential_backoff(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate the delay in milliseconds before retry `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let delay = if self.exponential_backoff && attempt > 0 {
            // base_delay * 2^(attempt-1), saturating so large attempts hit the cap
            let factor = 2_u64.saturating_pow(attempt - 1);
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms)
        } else {
            self.base_delay_ms
        };

        if self.jitter_factor > 0.0 {
            let jitter = (delay as f64 * self.jitter_factor * fastrand::f64()).round() as u64;
            delay + jitter
        } else {
            delay
        }
    }

    /// Same as [`calculate_delay`](Self::calculate_delay) as a `Duration`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.calculate_delay(attempt))
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_exponential_backoff() -> bool {
    true
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_jitter_factor() -> f64 {
    0.1
}
