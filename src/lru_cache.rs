//! Provides a bounded least-recently-used cache.
//!
//! The cache is safe for concurrent use: the map and the recency state are
//! protected by one mutex.  Recency is tracked with a monotonically
//! increasing use counter per entry; eviction scans for the smallest
//! counter, which is fine for the small capacities this crate uses.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Cache entry, wrapping the cached object.
struct CacheEntry<V: ?Sized> {
    /// When this entry was last accessed.
    last_used: u64,

    /// Cached object.
    value: Arc<V>,
}

/// Mutex-protected cache state.
struct LruCacheInner<K, V: ?Sized> {
    /// Cache entries.
    entries: HashMap<K, CacheEntry<V>>,

    /// Monotonically increasing counter to generate use "timestamps".
    tick: u64,
}

/// Least-recently-used cache.
///
/// Keeps the most recently used entries up to a limited count.
pub(crate) struct LruCache<K, V: ?Sized> {
    /// Cache state.
    inner: Mutex<LruCacheInner<K, V>>,

    /// Upper limit of how many entries to cache.
    capacity: usize,
}

impl<K: Copy + Eq + Hash, V: ?Sized> LruCache<K, V> {
    /// Create a new empty cache that can hold up to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        LruCache {
            inner: Mutex::new(LruCacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity,
        }
    }

    /// Retrieve an entry from the cache, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            Arc::clone(&entry.value)
        })
    }

    /// Add an entry to the cache, evicting the least recently used entry
    /// when the cache is full.  An existing entry under the same key is
    /// replaced.
    pub fn insert(&self, key: K, value: Arc<V>) {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                last_used: tick,
                value,
            },
        );
    }

    /// Whether the cache currently holds an entry for `key`.
    ///
    /// Does not affect recency.
    #[cfg(test)]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache: LruCache<u64, u64> = LruCache::new(3);
        for i in 0..3u64 {
            cache.insert(i, Arc::new(i));
        }

        // One more insert pushes out the first-inserted entry.
        cache.insert(3, Arc::new(3));
        assert!(!cache.contains(&0));
        for i in 1..=3u64 {
            assert_eq!(cache.get(&i).as_deref(), Some(&i));
        }
    }

    #[test]
    fn access_refreshes_recency() {
        let cache: LruCache<u64, u64> = LruCache::new(2);
        cache.insert(1, Arc::new(1));
        cache.insert(2, Arc::new(2));

        // Touch 1 so that 2 becomes the eviction candidate.
        assert!(cache.get(&1).is_some());
        cache.insert(3, Arc::new(3));

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn replaces_existing_entry() {
        let cache: LruCache<u64, u64> = LruCache::new(2);
        cache.insert(1, Arc::new(1));
        cache.insert(1, Arc::new(42));
        assert_eq!(cache.get(&1).as_deref(), Some(&42));
    }
}
