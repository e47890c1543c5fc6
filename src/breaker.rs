//! Circuit breaker with lazy time-based recovery
//!
//! The breaker is a per-dependency state machine: Closed passes calls
//! through and counts failures, Open rejects calls outright, HalfOpen
//! admits a bounded number of probes to test recovery. Transitions are
//! evaluated lazily at access time against the wall clock; there is no
//! background timer task.
//!
//! Every transition starts a new *generation* and clears the counters.
//! A call records its admission generation and its outcome is discarded
//! if the breaker has moved on by the time the call completes, so a slow
//! call from before a trip can never corrupt the fresh generation's
//! counters.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancellation::CancellationContext;
use crate::error::{BreakerError, ConfigError, ConfigResult};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail immediately without invoking the operation.
    Open,
    /// A bounded number of probe calls are allowed through.
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Per-generation call counters.
///
/// Cleared to zero on every state transition; consecutive counters reset
/// each other on the opposite outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Calls admitted in this generation.
    pub requests: u32,
    /// Successful outcomes recorded in this generation.
    pub total_successes: u32,
    /// Failed outcomes recorded in this generation.
    pub total_failures: u32,
    /// Successes since the last failure.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

impl Counts {
    // A Closed generation only ends on a trip, so a healthy breaker's
    // counters can run for the life of the process. Saturate instead of
    // overflowing.
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Predicate deciding whether an operation error still counts as success.
///
/// Default behaviour (no predicate) treats every `Err` as a failure.
pub type SuccessPredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Hook invoked with `(name, from, to)` on every state transition.
///
/// Invoked after the breaker's lock is released; hooks must be fast and
/// non-blocking, since a slow hook delays only its own caller but a
/// blocking one can still stall that call indefinitely.
pub type StateChangeHook = Arc<dyn Fn(&str, State, State) + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed state that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen state that close the breaker.
    pub success_threshold: u32,
    /// How long an Open breaker rejects calls before probing.
    /// Zero means the next access after opening may probe immediately.
    pub timeout: Duration,
    /// Probe calls allowed in flight simultaneously while HalfOpen.
    pub max_half_open_requests: u32,
    /// Optional predicate reclassifying operation errors as successes.
    #[serde(skip)]
    pub is_successful: Option<SuccessPredicate>,
    /// Optional observer for state transitions.
    #[serde(skip)]
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            max_half_open_requests: 1,
            is_successful: None,
            on_state_change: None,
        }
    }
}

impl fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("timeout", &self.timeout)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("is_successful", &self.is_successful.as_ref().map(|_| "<fn>"))
            .field("on_state_change", &self.on_state_change.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl BreakerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::validation("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::validation("success_threshold must be greater than 0"));
        }
        if self.max_half_open_requests == 0 {
            return Err(ConfigError::validation("max_half_open_requests must be greater than 0"));
        }
        Ok(())
    }

    /// Set the consecutive-failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the consecutive-success threshold.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open-state timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the concurrent probe limit.
    #[must_use]
    pub fn with_max_half_open_requests(mut self, max: u32) -> Self {
        self.max_half_open_requests = max;
        self
    }

    /// Install a success predicate.
    #[must_use]
    pub fn with_success_predicate(
        mut self,
        predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_successful = Some(Arc::new(predicate));
        self
    }

    /// Install a state-change hook.
    #[must_use]
    pub fn with_state_change_hook(
        mut self,
        hook: impl Fn(&str, State, State) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(hook));
        self
    }
}

/// Read-only snapshot of a breaker, suitable for a health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// State at snapshot time. An expired-but-unprobed breaker still
    /// reports `Open`; the next call corrects it.
    pub state: State,
    /// Generation at snapshot time.
    pub generation: u64,
    /// Counters for the current generation.
    pub counts: Counts,
}

/// State, counters, expiry and generation form one atomic unit.
#[derive(Debug)]
struct Inner {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    /// Probes admitted in HalfOpen whose outcome has not been recorded
    /// yet. Bounds concurrent probes, not probes per generation: a slot
    /// is released as soon as its outcome lands, so a breaker needing
    /// several consecutive successes can probe through one slot.
    inflight_probes: u32,
}

struct Transition {
    from: State,
    to: State,
}

/// Rejection decided under the lock, converted to a typed error outside it.
enum Rejection {
    Open { retry_after: Option<Duration> },
    ProbeLimit,
}

impl Rejection {
    fn into_error<E>(self) -> BreakerError<E> {
        match self {
            Self::Open { retry_after } => BreakerError::Open { retry_after },
            Self::ProbeLimit => BreakerError::ProbeLimit,
        }
    }
}

/// Circuit breaker protecting one dependency.
///
/// All methods are safe for concurrent use; the internal lock is held
/// only for admission and outcome bookkeeping, never across the wrapped
/// operation.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
                inflight_probes: 0,
            }),
        })
    }

    /// Create a breaker with the default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default()).expect("default configuration is valid")
    }

    /// The breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker's configuration.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, applying the lazy Open → HalfOpen transition first.
    pub fn state(&self) -> State {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.advance(&mut inner, Instant::now());
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Counters for the current generation.
    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    /// Snapshot without mutating any state.
    pub fn snapshot(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            generation: inner.generation,
            counts: inner.counts,
        }
    }

    /// Execute an operation behind the breaker.
    ///
    /// The operation runs outside the breaker's lock. If its future
    /// panics or is dropped mid-flight, the attempt is recorded as a
    /// failure before the unwind propagates.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let generation = self.admit()?;

        let guard = CallGuard {
            breaker: self,
            generation,
            armed: true,
        };
        let result = operation().await;
        guard.disarm();

        self.settle(generation, result)
    }

    /// Execute an operation behind the breaker with cancellation support.
    ///
    /// A call cancelled mid-flight records a failure for its generation
    /// (the probe never reported back, so the breaker fails closed) and
    /// returns [`BreakerError::Cancelled`].
    pub async fn execute_with_cancellation<T, E, F, Fut>(
        &self,
        operation: F,
        cancellation: &CancellationContext,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        if cancellation.is_cancelled() {
            return Err(BreakerError::Cancelled {
                reason: cancellation.reason().map(str::to_owned),
            });
        }

        let generation = self.admit()?;

        let guard = CallGuard {
            breaker: self,
            generation,
            armed: true,
        };
        let outcome = tokio::select! {
            result = operation() => Some(result),
            () = cancellation.cancelled() => None,
        };
        guard.disarm();

        match outcome {
            Some(result) => self.settle(generation, result),
            None => {
                self.after_request(generation, false, Instant::now());
                Err(BreakerError::Cancelled {
                    reason: cancellation.reason().map(str::to_owned),
                })
            }
        }
    }

    /// Reset the breaker to Closed, starting a new generation.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == State::Closed {
                inner.counts.clear();
                None
            } else {
                Some(self.transition(&mut inner, State::Closed, Instant::now()))
            }
        };
        info!(breaker = %self.name, "circuit breaker manually reset");
        self.notify(transition);
    }

    /// Admission check; returns the generation the call belongs to.
    fn admit<E>(&self) -> Result<u64, BreakerError<E>> {
        let now = Instant::now();
        let (decision, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.advance(&mut inner, now);
            let decision = match inner.state {
                State::Open => {
                    let retry_after = inner.expiry.map(|e| e.saturating_duration_since(now));
                    Err(Rejection::Open { retry_after })
                }
                State::HalfOpen
                    if inner.inflight_probes >= self.config.max_half_open_requests =>
                {
                    Err(Rejection::ProbeLimit)
                }
                State::HalfOpen => {
                    inner.inflight_probes += 1;
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
                State::Closed => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (decision, transition)
        };
        self.notify(transition);

        match decision {
            Ok(generation) => Ok(generation),
            Err(rejection) => {
                debug!(breaker = %self.name, "call rejected by circuit breaker");
                Err(rejection.into_error())
            }
        }
    }

    /// Classify the outcome and record it against the call's generation.
    fn settle<T, E>(&self, generation: u64, result: Result<T, E>) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + 'static,
    {
        let success = match &result {
            Ok(_) => true,
            Err(e) => self.config.is_successful.as_ref().is_some_and(|p| p(e)),
        };
        self.after_request(generation, success, Instant::now());
        result.map_err(BreakerError::Inner)
    }

    /// Record an outcome for the given generation; stale outcomes are
    /// discarded entirely.
    fn after_request(&self, generation: u64, success: bool, now: Instant) {
        let transition = {
            let mut inner = self.inner.lock();
            let mut transition = self.advance(&mut inner, now);
            if inner.generation == generation {
                // A matching generation means no transition happened since
                // admission, so a half-open probe releases its slot here.
                if inner.state == State::HalfOpen {
                    inner.inflight_probes = inner.inflight_probes.saturating_sub(1);
                }
                transition = transition.or_else(|| self.record(&mut inner, success, now));
            } else {
                debug!(
                    breaker = %self.name,
                    stale_generation = generation,
                    current_generation = inner.generation,
                    "discarding outcome from a previous generation"
                );
            }
            transition
        };
        self.notify(transition);
    }

    fn record(&self, inner: &mut Inner, success: bool, now: Instant) -> Option<Transition> {
        match (success, inner.state) {
            (true, State::Closed) => {
                inner.counts.on_success();
                None
            }
            (true, State::HalfOpen) => {
                inner.counts.on_success();
                (inner.counts.consecutive_successes >= self.config.success_threshold)
                    .then(|| self.transition(inner, State::Closed, now))
            }
            (false, State::Closed) => {
                inner.counts.on_failure();
                (inner.counts.consecutive_failures >= self.config.failure_threshold)
                    .then(|| self.transition(inner, State::Open, now))
            }
            // A single probe failure re-opens the breaker.
            (false, State::HalfOpen) => Some(self.transition(inner, State::Open, now)),
            // Entering Open bumps the generation, so a matching-generation
            // outcome can only arrive in the state that admitted the call.
            (_, State::Open) => {
                warn!(breaker = %self.name, "outcome recorded in open state");
                None
            }
        }
    }

    /// Lazy Open → HalfOpen transition once the open interval has elapsed.
    fn advance(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        if inner.state == State::Open && inner.expiry.is_some_and(|expiry| now >= expiry) {
            return Some(self.transition(inner, State::HalfOpen, now));
        }
        None
    }

    /// Apply a transition: new state, new generation, cleared counters.
    fn transition(&self, inner: &mut Inner, to: State, now: Instant) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.counts.clear();
        inner.inflight_probes = 0;
        inner.expiry = match to {
            State::Open => Some(now + self.config.timeout),
            State::Closed | State::HalfOpen => None,
        };
        Transition { from, to }
    }

    /// Invoked after the lock is released so a slow hook cannot stall
    /// other callers or deadlock on re-entrant breaker access.
    fn notify(&self, transition: Option<Transition>) {
        let Some(t) = transition else { return };
        info!(
            breaker = %self.name,
            from = %t.from,
            to = %t.to,
            "circuit breaker state changed"
        );
        if let Some(hook) = &self.config.on_state_change {
            hook(&self.name, t.from, t.to);
        }
    }
}

/// Records a failure for an admitted call whose future unwound or was
/// dropped before reporting an outcome.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl CallGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker
                .after_request(self.generation, false, Instant::now());
        }
    }
}
