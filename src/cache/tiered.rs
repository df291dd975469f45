//! Tiered cache facade: L1 lookup, then L2, with L1 backfill.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use super::{CacheClass, LocalCache, RemoteCache, cache_key};

/// Counters for the `/metrics` surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub remote_errors: u64,
    pub l2_active: bool,
}

/// Two-tier cache. All methods are infallible from the caller's view:
/// remote-tier failures are counted, logged, and treated as misses.
pub struct TieredCache {
    local: LocalCache,
    remote: Option<RemoteCache>,
    hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
}

impl TieredCache {
    pub fn new(local: LocalCache, remote: Option<RemoteCache>) -> Self {
        Self {
            local,
            remote,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
        }
    }

    /// Look up a canonical input. L1 first; on L1 miss, L2, backfilling
    /// L1 on a hit so the next lookup stays in-process.
    pub async fn get(&self, class: CacheClass, canonical: &str) -> Option<Bytes> {
        let key = cache_key(class, canonical);

        if let Some(value) = self.local.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(remote) = &self.remote {
            match remote.get(&key).await {
                Ok(Some(value)) => {
                    self.local.put(key, value.clone());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Ok(None) => {}
                Err(err) => {
                    self.remote_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, class = class.prefix(), "L2 cache read failed, serving L1-only");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value in both tiers. L2 write failures degrade silently.
    pub async fn put(&self, class: CacheClass, canonical: &str, value: Bytes) {
        let key = cache_key(class, canonical);
        self.local.put(key.clone(), value.clone());

        if let Some(remote) = &self.remote
            && let Err(err) = remote.put(class, &key, &value).await
        {
            self.remote_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, class = class.prefix(), "L2 cache write failed");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            l2_active: self.remote.is_some(),
        }
    }
}
