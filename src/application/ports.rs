//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Instant;

/// Port for obtaining current time.
///
/// Monotonic time drives heartbeat expiry, limiter refill and breaker
/// timeouts; wall-clock time stamps service records and events.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;

    /// Get the current wall-clock time.
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Port for a concurrent keyed cache of shared instances.
///
/// The limiter and breaker managers keep one instance per key here. Values
/// are cheap handles (typically `Arc`) and are cloned out on every access.
/// Infrastructure provides concrete implementations (ShardedStorage).
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Look up an existing value.
    fn get(&self, key: &K) -> Option<V>;

    /// Return the value for `key`, creating it with `factory` if absent.
    ///
    /// Implementations must guarantee that concurrent first access for the
    /// same key runs `factory` at most once and every caller observes the
    /// same value. A failing factory leaves the key absent.
    fn get_or_try_insert_with<E, F>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>;

    /// Remove a value, returning it if present.
    fn remove(&self, key: &K) -> Option<V>;

    /// Remove a value only if `predicate` holds for it, returning it if removed.
    ///
    /// The check and the removal are atomic with respect to other writers
    /// of the same key.
    fn remove_if<F>(&self, key: &K, predicate: F) -> Option<V>
    where
        F: FnOnce(&K, &V) -> bool;

    /// Keep only the entries for which `f` returns true.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Clear all entries from the storage.
    fn clear(&self);

    /// Iterate over all entries, providing access to both key and value.
    fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V);
}
