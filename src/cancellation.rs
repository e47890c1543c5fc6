//! Cancellation handle shared by the breaker and the retry executor
//!
//! Wraps a [`CancellationToken`] with an optional human-readable reason so
//! rejected callers can tell "gave up due to shutdown" apart from other
//! failures.

use tokio_util::sync::CancellationToken;

/// Cancellation signal for resilience operations.
///
/// Cloning produces a handle to the same underlying token; [`child`]
/// produces a context cancelled together with its parent, which is the
/// usual shape for wiring a process-wide shutdown signal into individual
/// call sites.
///
/// [`child`]: CancellationContext::child
#[derive(Debug, Clone)]
pub struct CancellationContext {
    token: CancellationToken,
    reason: Option<String>,
}

impl CancellationContext {
    /// Create a new, un-cancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: None,
        }
    }

    /// Create a context carrying a reason string.
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Some(reason.into()),
        }
    }

    /// Create a child context that is cancelled when this one is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: self.reason.clone(),
        }
    }

    /// Trigger cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The reason supplied at construction, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn child_follows_parent() {
        let parent = CancellationContext::with_reason("shutdown");
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("shutdown"));
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let ctx = CancellationContext::new();
        let waiter = ctx.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        handle.await.unwrap();
    }
}
