//! Remote L2 cache tier backed by redis.

use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::CacheClass;
use crate::error::CacheError;

/// Redis-backed tier with per-class TTLs.
///
/// The connection manager reconnects on its own; individual command
/// failures are surfaced as [`CacheError`] and handled by the tiered
/// wrapper as misses.
#[derive(Clone)]
pub struct RemoteCache {
    manager: ConnectionManager,
}

impl RemoteCache {
    /// Connect to redis. Fails fast on an unparseable URL or an
    /// unreachable server so boot can log the degradation once.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    pub async fn put(&self, class: CacheClass, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let ttl = class.ttl().as_secs();
        let _: () = conn.set_ex(key, value, ttl).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache").finish_non_exhaustive()
    }
}
