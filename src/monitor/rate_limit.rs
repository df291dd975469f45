//! Per-route token buckets keyed by caller identity.
//!
//! Buckets refill continuously at `per_min / 60` tokens per second up to
//! the per-minute capacity. Exhaustion yields a retry-after hint sized to
//! the time until one token is available.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Routes with independent limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Chat,
    Models,
    Health,
    Metrics,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// One token bucket.
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(per_min: u32) -> Self {
        let capacity = f64::from(per_min.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn check(&self) -> RateDecision {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let deficit = 1.0 - state.tokens;
            let secs = deficit / self.refill_per_sec;
            RateDecision::Limited {
                retry_after: Duration::from_secs(secs.ceil().max(1.0) as u64),
            }
        }
    }
}

/// A map of caller identity to token bucket for one route.
///
/// Read-lock fast path for existing callers, write lock only on first
/// sight of a caller. On lock poisoning the request is allowed rather
/// than crashing the server.
pub struct KeyedRateLimiter {
    limiters: RwLock<HashMap<String, TokenBucket>>,
    per_min: u32,
}

impl KeyedRateLimiter {
    pub fn new(per_min: u32) -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            per_min,
        }
    }

    pub fn check(&self, caller: &str) -> RateDecision {
        {
            let map = match self.limiters.read() {
                Ok(m) => m,
                Err(e) => e.into_inner(),
            };
            if let Some(bucket) = map.get(caller) {
                return bucket.check();
            }
        }
        let mut map = match self.limiters.write() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        map.entry(caller.to_string())
            .or_insert_with(|| TokenBucket::new(self.per_min))
            .check()
    }
}

/// All per-route limiters.
pub struct RateLimits {
    chat: KeyedRateLimiter,
    models: KeyedRateLimiter,
    health: KeyedRateLimiter,
    metrics: KeyedRateLimiter,
}

impl RateLimits {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            chat: KeyedRateLimiter::new(config.chat_per_min),
            models: KeyedRateLimiter::new(config.models_per_min),
            health: KeyedRateLimiter::new(config.health_per_min),
            metrics: KeyedRateLimiter::new(config.metrics_per_min),
        }
    }

    pub fn check(&self, route: Route, caller: &str) -> RateDecision {
        match route {
            Route::Chat => self.chat.check(caller),
            Route::Models => self.models.check(caller),
            Route::Health => self.health.check(caller),
            Route::Metrics => self.metrics.check(caller),
        }
    }
}
