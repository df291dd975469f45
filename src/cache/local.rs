//! In-process L1 cache: LRU with a single TTL.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;

struct Entry {
    value: Bytes,
    inserted_at: Instant,
}

/// Bounded LRU cache with entry TTL.
///
/// `std::sync::Mutex` (not tokio): the lock is never held across an
/// `.await` point, so blocking acquisition is safe and keeps the cache
/// usable from sync contexts.
pub struct LocalCache {
    inner: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl LocalCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Fetch a live entry, refreshing its recency. Expired entries are
    /// removed on access.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                guard.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert a value, evicting the least recently used entry if full.
    pub fn put(&self, key: String, value: Bytes) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_put_round_trips() {
        let cache = LocalCache::new(10, Duration::from_secs(60));
        cache.put("k".into(), Bytes::from_static(b"v"));
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn expired_entries_are_dropped_on_access() {
        let cache = LocalCache::new(10, Duration::from_millis(0));
        cache.put("k".into(), Bytes::from_static(b"v"));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = LocalCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), Bytes::from_static(b"1"));
        cache.put("b".into(), Bytes::from_static(b"2"));
        // Touch "a" so "b" is the LRU entry.
        assert!(cache.get("a").is_some());
        cache.put("c".into(), Bytes::from_static(b"3"));
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = LocalCache::new(10, Duration::from_secs(60));
        cache.put("k".into(), Bytes::from_static(b"v"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
