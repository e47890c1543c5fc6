//! Retry executor with exponential backoff and jitter
//!
//! Delays grow geometrically from [`RetryConfig::initial_interval`] up to
//! [`RetryConfig::max_interval`], then get a symmetric random perturbation
//! so a fleet of clients retrying the same outage does not stampede the
//! recovering service in lockstep.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancellation::CancellationContext;
use crate::error::{ConfigError, ConfigResult, RetryError};
use crate::retryable::Retryable;

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; 3 means up to 4 invocations.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Ceiling on the computed delay, applied before jitter.
    pub max_interval: Duration,
    /// Geometric growth factor per attempt.
    pub multiplier: f64,
    /// Jitter fraction in `0.0..=1.0`; 0.1 perturbs delays by ±10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.multiplier < 1.0 {
            return Err(ConfigError::validation("multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::validation("jitter must be within 0.0..=1.0"));
        }
        if self.initial_interval > self.max_interval {
            return Err(ConfigError::validation(
                "initial_interval must not exceed max_interval",
            ));
        }
        Ok(())
    }

    /// Set the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the initial delay.
    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the delay ceiling.
    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Executes operations with retries and exponential backoff.
///
/// Cheap to construct; the only shared state is the jitter RNG.
pub struct Retryer {
    config: RetryConfig,
    rng: Mutex<fastrand::Rng>,
}

impl fmt::Debug for Retryer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Retryer {
    fn default() -> Self {
        Self::new(RetryConfig::default()).expect("default configuration is valid")
    }
}

impl Retryer {
    /// Create a retryer with the given configuration.
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: Mutex::new(fastrand::Rng::new()),
        })
    }

    /// Create a retryer with a seeded jitter RNG, for deterministic tests.
    pub fn with_seed(config: RetryConfig, seed: u64) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        })
    }

    /// The retryer's configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Jittered delay before retry number `attempt` (zero-based: attempt 0
    /// is the delay between the first invocation and the first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.jittered(self.base_delay(attempt))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.config.initial_interval.as_secs_f64()
            * self.config.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(scaled.min(self.config.max_interval.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter == 0.0 {
            return delay;
        }
        // Uniform in [-1, 1], scaled by the jitter fraction.
        let unit = self.rng.lock().f64().mul_add(2.0, -1.0);
        let factor = self.config.jitter.mul_add(unit, 1.0);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }

    /// Run the operation, retrying retryable failures with backoff.
    ///
    /// Non-retryable errors fail fast as [`RetryError::Permanent`]; once
    /// the budget is exhausted the last error comes back inside
    /// [`RetryError::Exhausted`].
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let never = CancellationContext::new();
        self.execute_with_cancellation(operation, &never).await
    }

    /// Run the operation with retries, aborting between attempts (and
    /// during backoff sleeps) when the context is cancelled. An attempt
    /// already in flight is allowed to finish.
    pub async fn execute_with_cancellation<T, E, F, Fut>(
        &self,
        mut operation: F,
        cancellation: &CancellationContext,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancellation.is_cancelled() {
                return Err(RetryError::Cancelled {
                    reason: cancellation.reason().map(str::to_owned),
                });
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => {
                    debug!(attempt, error = %error, "permanent error, not retrying");
                    return Err(RetryError::Permanent(error));
                }
                Err(error) if attempt >= self.config.max_retries => {
                    warn!(
                        attempts = attempt + 1,
                        error = %error,
                        "retry budget exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        source: error,
                    });
                }
                Err(error) => {
                    // An error that knows its own recovery time overrides
                    // the computed base delay; jitter still applies.
                    let delay = match error.retry_after() {
                        Some(hint) => self.jittered(hint),
                        None => self.backoff(attempt),
                    };
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancellation.cancelled() => {
                            return Err(RetryError::Cancelled {
                                reason: cancellation.reason().map(str::to_owned),
                            });
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}
