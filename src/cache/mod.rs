//! Two-tier cache: in-process LRU in front of an optional remote
//! key-value store.
//!
//! Keys are class-prefixed SHA-256 hashes of the canonical input, so the
//! same logical request always lands on the same entry in both tiers.
//! An unreachable remote tier degrades the cache to L1-only; it never
//! produces a request-visible error.

mod local;
mod remote;
mod tiered;

pub use local::LocalCache;
pub use remote::RemoteCache;
pub use tiered::{CacheStats, TieredCache};

use std::time::Duration;

use sha2::{Digest, Sha256};

/// Cache entry classes with their remote-tier TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    Search,
    LlmResponse,
    SchemaFields,
    CreditReport,
}

impl CacheClass {
    /// Remote-tier TTL for this class.
    pub fn ttl(&self) -> Duration {
        match self {
            CacheClass::Search => Duration::from_secs(3_600),
            CacheClass::LlmResponse => Duration::from_secs(24 * 3_600),
            CacheClass::SchemaFields => Duration::from_secs(3_600),
            CacheClass::CreditReport => Duration::from_secs(30 * 60),
        }
    }

    /// Key prefix, also used as the class label in stats.
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheClass::Search => "search",
            CacheClass::LlmResponse => "llm_response",
            CacheClass::SchemaFields => "schema_fields",
            CacheClass::CreditReport => "credit_report",
        }
    }
}

/// Build the class-prefixed key for a canonical input.
pub fn cache_key(class: CacheClass, canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{}:{:x}", class.prefix(), hasher.finalize())
}
