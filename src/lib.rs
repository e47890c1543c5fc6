//! Circuit breaker and retry primitives for calls to unreliable
//! dependencies.
//!
//! Two composable building blocks:
//!
//! - [`CircuitBreaker`]: a Closed / Open / HalfOpen state machine that
//!   sheds load from a failing dependency and probes for recovery, with
//!   a [`Registry`] for managing one breaker per dependency.
//! - [`Retryer`]: exponential backoff with jitter, driven by the
//!   [`Retryable`] classification on the operation's error type.
//!
//! Both are `async` and cancellation-aware via [`CancellationContext`].
//!
//! # Example
//!
//! ```no_run
//! use breakwater::{CircuitBreaker, RetryConfig, Retryer};
//!
//! # #[derive(thiserror::Error, Debug)]
//! # #[error("backend unavailable")]
//! # struct BackendError;
//! # impl breakwater::Retryable for BackendError {}
//! # async fn call_backend() -> Result<String, BackendError> { Ok(String::new()) }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::with_defaults("backend");
//! let retryer = Retryer::new(RetryConfig::default())?;
//!
//! // Retry around the breaker: rejections while open are retried after
//! // the breaker's own recovery hint.
//! let value = retryer
//!     .execute(|| breaker.execute(|| call_backend()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod breaker;
pub mod cancellation;
pub mod error;
pub mod registry;
pub mod retry;
pub mod retryable;

pub use breaker::{
    BreakerConfig, BreakerStats, CircuitBreaker, Counts, State, StateChangeHook, SuccessPredicate,
};
pub use cancellation::CancellationContext;
pub use error::{BreakerError, ConfigError, ConfigResult, RetryError};
pub use registry::{ConfigFactory, Registry};
pub use retry::{RetryConfig, Retryer};
pub use retryable::{Retryable, RetryableError};

/// Commonly used types, for glob import.
pub mod prelude {
    pub use crate::breaker::{BreakerConfig, CircuitBreaker, State};
    pub use crate::cancellation::CancellationContext;
    pub use crate::error::{BreakerError, RetryError};
    pub use crate::registry::Registry;
    pub use crate::retry::{RetryConfig, Retryer};
    pub use crate::retryable::Retryable;
}
