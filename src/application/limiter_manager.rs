//! Keyed cache of rate limiters.
//!
//! Each operation class (e.g. `"service_registration"`) gets its own limiter,
//! created on first use from the config handed to [`RateLimiterManager::get_limiter`].

use crate::application::limiter::{new_limiter, LimiterConfig, LimiterError, LimiterStats, RateLimiter};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::infrastructure::storage::ShardedStorage;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type SharedLimiter = Arc<dyn RateLimiter>;

/// Lazily creates and caches one limiter per key.
///
/// Generic over the storage backend; defaults to [`ShardedStorage`].
pub struct RateLimiterManager<S = ShardedStorage<String, SharedLimiter>>
where
    S: Storage<String, SharedLimiter>,
{
    storage: S,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl RateLimiterManager {
    pub fn new(clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self::with_storage(ShardedStorage::new(), clock, metrics)
    }
}

impl<S> RateLimiterManager<S>
where
    S: Storage<String, SharedLimiter>,
{
    pub fn with_storage(storage: S, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            storage,
            clock,
            metrics,
        }
    }

    /// Get the limiter for `key`, building it from `config` on first access.
    ///
    /// An existing limiter is returned as-is even if `config` differs from
    /// the one it was built with. Concurrent first access builds exactly one.
    pub fn get_limiter(
        &self,
        key: &str,
        config: &LimiterConfig,
    ) -> Result<SharedLimiter, LimiterError> {
        self.storage.get_or_try_insert_with(key.to_string(), || {
            let limiter = new_limiter(config, Arc::clone(&self.clock))?;
            self.metrics.record_limiter_created();
            debug!(key, algorithm = %config.algorithm, rate = config.rate, "created rate limiter");
            Ok(limiter)
        })
    }

    /// Drop the limiter for `key`. The next access rebuilds it.
    pub fn remove_limiter(&self, key: &str) -> bool {
        self.storage.remove(&key.to_string()).is_some()
    }

    /// Stats of every managed limiter, by key.
    pub fn stats(&self) -> BTreeMap<String, LimiterStats> {
        let mut stats = BTreeMap::new();
        self.storage.for_each(|key, limiter| {
            stats.insert(key.clone(), limiter.stats());
        });
        stats
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl<S> fmt::Debug for RateLimiterManager<S>
where
    S: Storage<String, SharedLimiter>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterManager")
            .field("limiters", &self.storage.len())
            .finish()
    }
}
