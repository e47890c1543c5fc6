//! Error classification for the retry executor
//!
//! Errors are retryable unless they say otherwise: a mis-labelled
//! transient error that fails fast hurts more than a few wasted attempts
//! on a permanent one.

use std::error::Error;
use std::fmt;
use std::io;
use std::time::Duration;

use crate::error::BreakerError;

/// Decides whether an error is worth retrying.
///
/// The default implementation retries everything and supplies no delay
/// hint; implementors opt specific variants out.
pub trait Retryable: Error {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool {
        true
    }

    /// A minimum delay before the next attempt, if the error knows one
    /// (rate limits, `Retry-After` headers, breaker timeouts).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Wrapper forcing an explicit retryability decision onto any error.
#[derive(Debug)]
pub struct RetryableError<E> {
    inner: E,
    retryable: bool,
}

impl<E: Error> RetryableError<E> {
    /// Wrap an error that should be retried.
    pub fn transient(inner: E) -> Self {
        Self { inner, retryable: true }
    }

    /// Wrap an error that should fail fast.
    pub fn permanent(inner: E) -> Self {
        Self { inner, retryable: false }
    }

    /// The wrapped error.
    pub fn into_inner(self) -> E {
        self.inner
    }

    /// A reference to the wrapped error.
    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: fmt::Display> fmt::Display for RetryableError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<E: Error + 'static> Error for RetryableError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E: Error + 'static> Retryable for RetryableError<E> {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// I/O errors are retryable for the transient kinds a network or disk
/// hiccup produces; everything else (not found, permissions, bad input)
/// fails fast.
impl Retryable for io::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                | io::ErrorKind::UnexpectedEof
        )
    }
}

/// Breaker rejections are retryable (the breaker may have recovered by
/// the next attempt) and carry the remaining open interval as a delay
/// hint; cancellation is final; inner errors delegate to their own
/// classification.
impl<E: Retryable + 'static> Retryable for BreakerError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Open { .. } | Self::ProbeLimit => true,
            Self::Cancelled { .. } => false,
            Self::Inner(e) => e.is_retryable(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Open { retry_after } => *retry_after,
            Self::Inner(e) => e.retry_after(),
            Self::ProbeLimit | Self::Cancelled { .. } => None,
        }
    }
}
