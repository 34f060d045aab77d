//! Keyed cache of circuit breakers.

use crate::application::circuit_breaker::{
    BreakerConfigError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    SharedCircuitBreaker,
};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::infrastructure::storage::ShardedStorage;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Lazily creates one breaker per key, all sharing one config.
///
/// Keys isolate failures per operation and target, e.g.
/// `"registration:payments"` and `"deregistration:payments-1"` trip
/// independently.
pub struct CircuitBreakerManager<S = ShardedStorage<String, SharedCircuitBreaker>>
where
    S: Storage<String, SharedCircuitBreaker>,
{
    storage: S,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl CircuitBreakerManager {
    /// Create a manager, validating `config` once for every breaker it builds.
    pub fn new(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Result<Self, BreakerConfigError> {
        Self::with_storage(ShardedStorage::new(), config, clock, metrics)
    }
}

impl<S> CircuitBreakerManager<S>
where
    S: Storage<String, SharedCircuitBreaker>,
{
    pub fn with_storage(
        storage: S,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Result<Self, BreakerConfigError> {
        config.validate()?;
        Ok(Self {
            storage,
            config,
            clock,
            metrics,
        })
    }

    /// Get the breaker for `key`, creating it on first access.
    pub fn get(&self, key: &str) -> SharedCircuitBreaker {
        let created = self
            .storage
            .get_or_try_insert_with::<Infallible, _>(key.to_string(), || {
                self.metrics.record_breaker_created();
                debug!(key, "created circuit breaker");
                Ok(Arc::new(CircuitBreaker::from_validated(
                    key.to_string(),
                    self.config.clone(),
                    Arc::clone(&self.clock),
                    self.metrics.clone(),
                )))
            });
        match created {
            Ok(breaker) => breaker,
            Err(never) => match never {},
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.storage.remove(&key.to_string()).is_some()
    }

    /// Drop the breaker for `key` if it is closed and has seen no failures.
    pub fn remove_idle(&self, key: &str) -> bool {
        self.storage
            .remove_if(&key.to_string(), |_, breaker| breaker.is_idle())
            .is_some()
    }

    /// Keep only the breakers for which `keep` returns true.
    ///
    /// Returns the number of breakers dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&str, &CircuitBreaker) -> bool,
    {
        let mut dropped = 0;
        self.storage.retain(|key, breaker| {
            let kept = keep(key.as_str(), breaker.as_ref());
            if !kept {
                dropped += 1;
            }
            kept
        });
        if dropped > 0 {
            debug!(dropped, "pruned circuit breakers");
        }
        dropped
    }

    /// Snapshots of every managed breaker, by key.
    pub fn snapshots(&self) -> BTreeMap<String, BreakerSnapshot> {
        let mut snapshots = BTreeMap::new();
        self.storage.for_each(|key, breaker| {
            snapshots.insert(key.clone(), breaker.snapshot());
        });
        snapshots
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl<S> fmt::Debug for CircuitBreakerManager<S>
where
    S: Storage<String, SharedCircuitBreaker>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("breakers", &self.storage.len())
            .finish()
    }
}
