//! Named circuit breaker registry
//!
//! One breaker per downstream dependency, created lazily the first time
//! a name is requested. The registry is meant to be built once at
//! startup and shared by handle; there is no process-global instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::breaker::{BreakerConfig, BreakerStats, CircuitBreaker};
use crate::error::ConfigResult;

/// Produces the configuration for a breaker created on first access.
pub type ConfigFactory = Box<dyn Fn(&str) -> BreakerConfig + Send + Sync>;

/// Collection of named circuit breakers.
pub struct Registry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    factory: ConfigFactory,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("breakers", &self.breakers.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry whose breakers use the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_factory(|_| BreakerConfig::default())
    }

    /// Create a registry with a per-name configuration factory.
    #[must_use]
    pub fn with_factory(factory: impl Fn(&str) -> BreakerConfig + Send + Sync + 'static) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Get the breaker for `name`, creating it on first access.
    ///
    /// Concurrent first accesses of the same name race to insert; the
    /// write lock is re-checked so every caller receives the same
    /// instance. A factory that produces an invalid configuration is
    /// replaced by the defaults rather than failing the lookup.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }

        let config = (self.factory)(name);
        let breaker = match CircuitBreaker::new(name, config) {
            Ok(breaker) => breaker,
            Err(error) => {
                warn!(
                    breaker = name,
                    %error,
                    "factory produced an invalid configuration, using defaults"
                );
                CircuitBreaker::with_defaults(name)
            }
        };
        debug!(breaker = name, "created circuit breaker");
        let breaker = Arc::new(breaker);
        breakers.insert(name.to_owned(), Arc::clone(&breaker));
        breaker
    }

    /// Register a breaker with an explicit configuration, replacing any
    /// existing breaker under the same name.
    pub fn register(
        &self,
        name: impl Into<String>,
        config: BreakerConfig,
    ) -> ConfigResult<Arc<CircuitBreaker>> {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), config)?);
        self.breakers.write().insert(name, Arc::clone(&breaker));
        Ok(breaker)
    }

    /// Remove a breaker; returns it if it was present. Existing handles
    /// keep working against the removed instance.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(name)
    }

    /// Whether a breaker exists under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.breakers.read().contains_key(name)
    }

    /// Names of all registered breakers, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of every breaker, keyed by name. Non-mutating: a breaker
    /// whose open interval has elapsed but which has not been probed yet
    /// still reports `Open`.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, BreakerStats> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::State;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("backend unavailable")]
    struct BackendError;

    #[test]
    fn get_creates_lazily_and_returns_same_instance() {
        let registry = Registry::new();
        assert!(!registry.contains("db"));

        let first = registry.get("db");
        let second = registry.get("db");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.contains("db"));
    }

    #[test]
    fn factory_configures_new_breakers_per_name() {
        let registry = Registry::with_factory(|name| {
            let threshold = if name == "cache" { 10 } else { 3 };
            BreakerConfig::default().with_failure_threshold(threshold)
        });

        assert_eq!(registry.get("cache").config().failure_threshold, 10);
        assert_eq!(registry.get("db").config().failure_threshold, 3);
    }

    #[test]
    fn invalid_factory_config_falls_back_to_defaults() {
        let registry =
            Registry::with_factory(|_| BreakerConfig::default().with_failure_threshold(0));
        let breaker = registry.get("db");
        assert_eq!(breaker.config().failure_threshold, 5);
    }

    #[test]
    fn register_replaces_and_remove_detaches() {
        let registry = Registry::new();
        let original = registry.get("db");

        let replacement = registry
            .register("db", BreakerConfig::default().with_failure_threshold(1))
            .unwrap();
        assert!(!Arc::ptr_eq(&original, &registry.get("db")));
        assert!(Arc::ptr_eq(&replacement, &registry.get("db")));

        let removed = registry.remove("db").unwrap();
        assert!(Arc::ptr_eq(&removed, &replacement));
        assert!(!registry.contains("db"));
        assert!(registry.remove("db").is_none());

        // The detached handle still functions.
        assert_eq!(removed.state(), State::Closed);
    }

    #[test]
    fn register_rejects_invalid_config() {
        let registry = Registry::new();
        let result = registry.register("db", BreakerConfig::default().with_success_threshold(0));
        assert!(result.is_err());
        assert!(!registry.contains("db"));
    }

    #[tokio::test]
    async fn stats_reports_every_breaker() {
        let registry = Registry::with_factory(|_| {
            BreakerConfig::default()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_secs(60))
        });

        let db = registry.get("db");
        let _ = db
            .execute(|| async { Err::<(), _>(BackendError) })
            .await;
        registry.get("cache");

        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["db"].state, State::Open);
        assert_eq!(stats["cache"].state, State::Closed);
        assert_eq!(registry.names(), vec!["cache".to_owned(), "db".to_owned()]);
    }
}
