//! Error types for the resilience layer

use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`CircuitBreaker::execute`](crate::CircuitBreaker::execute).
///
/// Rejections (`Open`, `ProbeLimit`) mean the wrapped operation was never
/// invoked; `Inner` carries the operation's own error unmodified.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// Circuit is open; the call was rejected without invoking the operation.
    #[error("circuit breaker is open")]
    Open {
        /// Time remaining until the breaker is eligible to probe again.
        retry_after: Option<Duration>,
    },

    /// Circuit is half-open and every probe slot is occupied by a call
    /// still in flight.
    #[error("circuit breaker is half-open and the probe limit is reached")]
    ProbeLimit,

    /// The call was cancelled before the operation completed.
    #[error("operation cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        /// Cancellation reason, if one was supplied.
        reason: Option<String>,
    },

    /// The operation ran and failed; its error is carried unmodified.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the breaker rejected the call without running the operation.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::ProbeLimit)
    }

    /// Extract the operation's own error, if the operation ran and failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors returned by [`Retryer::execute`](crate::Retryer::execute).
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The retry budget was exhausted; carries the last underlying error.
    #[error("retry budget exhausted after {attempts} attempts")]
    Exhausted {
        /// Total attempts made, including the initial one.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: E,
    },

    /// The operation failed with an error classified as not retryable.
    /// Carried unmodified; only one attempt was made after it occurred.
    #[error(transparent)]
    Permanent(E),

    /// Cancellation fired before or between attempts.
    #[error("operation cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        /// Cancellation reason, if one was supplied.
        reason: Option<String>,
    },
}

impl<E> RetryError<E> {
    /// The underlying operation error, if any attempt produced one.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::Permanent(source) => Some(source),
            Self::Cancelled { .. } => None,
        }
    }

    /// Extract the underlying operation error, if any attempt produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::Permanent(source) => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Invalid configuration for a breaker or retryer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration field failed validation.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;
