//! Rate limiting and operation monitoring.

mod rate_limit;
mod timers;

pub use rate_limit::{KeyedRateLimiter, RateDecision, RateLimits, Route};
pub use timers::{MonitorSnapshot, OpStats, OperationMonitor, TimerId};
