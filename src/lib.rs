//! Vigil: an OpenAI-compatible LLM gateway with an autonomous
//! quality-management core.
//!
//! The gateway serves chat completions across multiple providers with
//! caching, failover, and rate limiting, while a set of background loops
//! (the "virtuous cycle") observes live traffic quality, detects
//! regressions, forecasts near-term quality, and runs statistically
//! validated optimization cycles over deployable prompt variants.
//!
//! Module map, leaves first:
//! - [`cache`]: two-tier (in-process LRU + redis) cache with per-class TTLs
//! - [`monitor`]: per-route token buckets and operation timers
//! - [`observability`]: client for the external trace/feedback backend
//! - [`quality`]: trace-to-quality normalization and rolling windows
//! - [`engine`]: the eight autonomous capabilities
//! - [`cycle`]: the four concurrent loops orchestrating everything
//! - [`gateway`]: provider abstraction, variants, request dispatch
//! - [`server`]: the axum HTTP surface

pub mod cache;
pub mod config;
pub mod cycle;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod observability;
pub mod quality;
pub mod server;
pub mod trace;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
