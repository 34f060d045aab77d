//! Keyed instance storage for the limiter and breaker managers.

use crate::application::ports::Storage;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;

/// Thread-safe sharded storage backed by DashMap.
///
/// Lookups take a shard read lock; first insertion goes through the entry
/// API, which holds the shard write lock while the factory runs. That gives
/// double-checked creation: a lock-free-ish fast path for existing keys and
/// at most one construction per key under contention.
#[derive(Debug)]
pub struct ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    map: DashMap<K, V>,
}

impl<K, V> ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a new sharded storage instance.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl<K, V> Default for ShardedStorage<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Storage<K, V> for ShardedStorage<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + std::fmt::Debug,
    V: Clone + Send + Sync + std::fmt::Debug,
{
    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn get_or_try_insert_with<E, F>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(existing) = self.get(&key) {
            return Ok(existing);
        }

        match self.map.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let value = factory()?;
                entry.insert(value.clone());
                Ok(value)
            }
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, value)| value)
    }

    fn remove_if<F>(&self, key: &K, predicate: F) -> Option<V>
    where
        F: FnOnce(&K, &V) -> bool,
    {
        self.map.remove_if(key, predicate).map(|(_, value)| value)
    }

    fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.map.retain(|key, value| f(key, value))
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn clear(&self) {
        self.map.clear()
    }

    fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for entry in self.map.iter() {
            f(entry.key(), entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_basic_operations() {
        let storage: ShardedStorage<String, u32> = ShardedStorage::new();

        let value: Result<u32, ()> = storage.get_or_try_insert_with("a".into(), || Ok(1));
        assert_eq!(value, Ok(1));
        assert_eq!(storage.get(&"a".to_string()), Some(1));
        assert_eq!(storage.get(&"b".to_string()), None);
        assert_eq!(storage.len(), 1);
        assert!(!storage.is_empty());
    }

    #[test]
    fn test_existing_value_wins() {
        let storage: ShardedStorage<&str, u32> = ShardedStorage::new();
        let _ = storage.get_or_try_insert_with::<(), _>("key", || Ok(100));
        let second = storage.get_or_try_insert_with::<(), _>("key", || Ok(200));
        assert_eq!(second, Ok(100));
    }

    #[test]
    fn test_failed_factory_leaves_key_absent() {
        let storage: ShardedStorage<&str, u32> = ShardedStorage::new();
        let result = storage.get_or_try_insert_with("key", || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let storage: ShardedStorage<&str, u32> = ShardedStorage::new();
        let _ = storage.get_or_try_insert_with::<(), _>("key1", || Ok(1));
        let _ = storage.get_or_try_insert_with::<(), _>("key2", || Ok(2));

        assert_eq!(storage.remove(&"key1"), Some(1));
        assert_eq!(storage.remove(&"key1"), None);
        assert_eq!(storage.len(), 1);

        storage.clear();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_remove_if_and_retain() {
        let storage: ShardedStorage<&str, u32> = ShardedStorage::new();
        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            let _ = storage.get_or_try_insert_with::<(), _>(key, || Ok(value));
        }

        assert_eq!(storage.remove_if(&"a", |_, v| *v > 1), None);
        assert_eq!(storage.remove_if(&"b", |_, v| *v > 1), Some(2));
        assert_eq!(storage.remove_if(&"missing", |_, _| true), None);

        storage.retain(|key, _| *key != "c");
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get(&"a"), Some(1));
    }

    #[test]
    fn test_concurrent_first_access_builds_once() {
        use std::thread;

        let storage: Arc<ShardedStorage<String, Arc<usize>>> = Arc::new(ShardedStorage::new());
        let built = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..16 {
            let storage = Arc::clone(&storage);
            let built = Arc::clone(&built);
            handles.push(thread::spawn(move || {
                storage
                    .get_or_try_insert_with::<(), _>("shared".to_string(), || {
                        built.fetch_add(1, Ordering::SeqCst);
                        Ok(Arc::new(7))
                    })
                    .unwrap()
            }));
        }

        let values: Vec<Arc<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
