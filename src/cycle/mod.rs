//! The virtuous cycle: orchestration of trace ingest, quality
//! monitoring, optimization, and housekeeping.

mod alerts;
mod manager;
mod optimizer;
mod queue;

pub use alerts::{AlertEvent, AlertLedger, AlertSeverity, DEFAULT_COOLDOWN};
pub use manager::{CycleMetricsSnapshot, CycleStatus, OptimizationTrigger, VirtuousCycleManager};
pub use queue::{QUEUE_CAP, TraceEnvelope, TraceQueue};
