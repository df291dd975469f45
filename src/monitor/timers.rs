//! Operation timers and counters with bounded in-memory history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Maximum retained samples per operation.
const HISTORY_CAP: usize = 10_000;

/// Opaque handle returned by [`OperationMonitor::start_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct ActiveTimer {
    op: String,
    started: Instant,
}

#[derive(Debug, Clone, Copy)]
struct TimerSample {
    elapsed: Duration,
    ok: bool,
}

/// Aggregated view of one operation's samples.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OpStats {
    pub count: usize,
    pub ok: usize,
    pub err: usize,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Counters plus per-operation timing stats.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitorSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub ops: BTreeMap<String, OpStats>,
}

struct MonitorInner {
    next_id: u64,
    active: HashMap<u64, ActiveTimer>,
    history: HashMap<String, VecDeque<TimerSample>>,
    last_success: HashMap<String, DateTime<Utc>>,
    counters: HashMap<String, u64>,
}

/// Process-lifetime operation monitor.
///
/// History is bounded per op; counters are unbounded integers reset on
/// restart. All state sits behind one mutex; every call is a short
/// critical section.
pub struct OperationMonitor {
    inner: Mutex<MonitorInner>,
}

impl Default for OperationMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                next_id: 0,
                active: HashMap::new(),
                history: HashMap::new(),
                last_success: HashMap::new(),
                counters: HashMap::new(),
            }),
        }
    }

    pub fn start_timer(&self, op: &str) -> TimerId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.active.insert(
            id,
            ActiveTimer {
                op: op.to_string(),
                started: Instant::now(),
            },
        );
        TimerId(id)
    }

    /// Close a timer. Unknown ids (already closed, or dropped during
    /// shutdown) are ignored.
    pub fn end_timer(&self, id: TimerId, ok: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(active) = inner.active.remove(&id.0) else {
            return;
        };
        let sample = TimerSample {
            elapsed: active.started.elapsed(),
            ok,
        };
        if ok {
            inner.last_success.insert(active.op.clone(), Utc::now());
        }
        let history = inner.history.entry(active.op).or_default();
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(sample);
    }

    pub fn increment(&self, counter: &str) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: &str, amount: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner.counters.entry(counter.to_string()).or_insert(0) += amount;
    }

    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counters.get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let counters = inner
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let ops = inner
            .history
            .iter()
            .map(|(op, samples)| {
                let count = samples.len();
                let ok = samples.iter().filter(|s| s.ok).count();
                let mut millis: Vec<f64> = samples
                    .iter()
                    .map(|s| s.elapsed.as_secs_f64() * 1_000.0)
                    .collect();
                millis.sort_by(|a, b| a.total_cmp(b));
                let mean_ms = if count == 0 {
                    0.0
                } else {
                    millis.iter().sum::<f64>() / count as f64
                };
                let p95_ms = percentile(&millis, 0.95);
                (
                    op.clone(),
                    OpStats {
                        count,
                        ok,
                        err: count - ok,
                        mean_ms,
                        p95_ms,
                        last_success_at: inner.last_success.get(op).copied(),
                    },
                )
            })
            .collect();

        MonitorSnapshot { counters, ops }
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
