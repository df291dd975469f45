//! Trace-to-quality normalization and the bounded quality ring.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::records::{QualityRecord, bucket_align};
use super::window::QualityWindow;
use crate::config::QualityConfig;
use crate::error::CollectorError;
use crate::trace::{Spectrum, TraceRecord};

/// Capacity of the quality ring. Older records age out.
const RING_CAP: usize = 10_000;

/// Broadcast fan-out capacity for subscribers.
const SUBSCRIBE_CAP: usize = 1_024;

/// Structural validation of a trace against its spectrum's expected
/// output shape. Failed invocations and empty outputs never pass; the
/// multi-field and context spectrums additionally require enough output
/// to plausibly carry their multi-part answers.
pub fn structurally_valid(trace: &TraceRecord) -> bool {
    if trace.error.is_some() || trace.output_tokens == 0 {
        return false;
    }
    let min_output = match trace.spectrum {
        Spectrum::MultiField => 8,
        Spectrum::Context => 4,
        _ => 1,
    };
    trace.output_tokens >= min_output
}

struct CollectorState {
    records: VecDeque<QualityRecord>,
    seen: HashSet<Uuid>,
    cached_live: Option<(Instant, QualityWindow)>,
    cached_baseline: Option<(Instant, QualityWindow)>,
}

/// Normalizes traces into [`QualityRecord`]s and serves rolling windows.
///
/// Duplicate detection covers the ids currently held in the ring: a
/// duplicate of a record that already aged out is indistinguishable from
/// a new trace, which bounds memory without a second ledger.
pub struct QualityCollector {
    config: QualityConfig,
    state: Mutex<CollectorState>,
    tx: broadcast::Sender<QualityRecord>,
}

impl QualityCollector {
    pub fn new(config: QualityConfig) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBE_CAP);
        Self {
            config,
            state: Mutex::new(CollectorState {
                records: VecDeque::with_capacity(RING_CAP),
                seen: HashSet::new(),
                cached_live: None,
                cached_baseline: None,
            }),
            tx,
        }
    }

    /// Deterministic fallback score from structural signals.
    fn fallback_score(&self, trace: &TraceRecord) -> f64 {
        let w = self.config.weights;
        let success = if trace.succeeded() { 1.0 } else { 0.0 };
        let latency =
            (1.0 - trace.latency_ms as f64 / self.config.slo_ms as f64).clamp(0.0, 1.0);
        let structure = if structurally_valid(trace) { 1.0 } else { 0.0 };
        w.success * success + w.latency * latency + w.structure * structure
    }

    /// Normalize and admit one trace. Explicit feedback wins over the
    /// fallback score. Malformed shapes and duplicates reject without
    /// side effects.
    pub fn ingest(&self, trace: &TraceRecord) -> Result<QualityRecord, CollectorError> {
        trace.validate()?;

        let score = trace
            .feedback_score
            .unwrap_or_else(|| self.fallback_score(trace));
        let record = QualityRecord {
            trace_id: trace.trace_id,
            model: trace.model.clone(),
            spectrum: trace.spectrum,
            score,
            latency_ms: trace.latency_ms,
            cost_estimate: Decimal::from(trace.total_tokens) * self.config.cost_per_token,
            window_bucket: bucket_align(trace.created_at),
            timestamp: trace.created_at,
        };

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.seen.insert(trace.trace_id) {
                return Err(CollectorError::DuplicateTrace {
                    trace_id: trace.trace_id,
                });
            }
            if state.records.len() >= RING_CAP
                && let Some(aged_out) = state.records.pop_front()
            {
                state.seen.remove(&aged_out.trace_id);
            }
            state.records.push_back(record.clone());
        }

        // Nobody listening is fine; loops subscribe lazily.
        let _ = self.tx.send(record.clone());
        Ok(record)
    }

    /// Subscribe to the live stream of quality records. The stream ends
    /// only when the collector is dropped at shutdown.
    pub fn subscribe(&self) -> broadcast::Receiver<QualityRecord> {
        self.tx.subscribe()
    }

    fn window(
        &self,
        duration: Duration,
        spectrum: Option<Spectrum>,
        model: Option<&str>,
    ) -> QualityWindow {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::hours(1));
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let records = state.records.iter().filter(|r| {
            r.timestamp >= cutoff
                && spectrum.is_none_or(|s| r.spectrum == s)
                && model.is_none_or(|m| r.model == m)
        });
        QualityWindow::compute(records, bucket_align(cutoff), duration)
    }

    /// Live-window aggregate, optionally filtered. The unfiltered
    /// snapshot is cached for one sample interval.
    pub fn snapshot(&self, spectrum: Option<Spectrum>, model: Option<&str>) -> QualityWindow {
        if spectrum.is_none() && model.is_none() {
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some((at, window)) = &state.cached_live
                    && at.elapsed() < self.config.cadence
                {
                    return window.clone();
                }
            }
            let window = self.window(self.config.live_window, None, None);
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.cached_live = Some((Instant::now(), window.clone()));
            return window;
        }
        self.window(self.config.live_window, spectrum, model)
    }

    /// Baseline-window aggregate, optionally filtered. The unfiltered
    /// snapshot is cached for one sample interval.
    pub fn baseline(&self, spectrum: Option<Spectrum>, model: Option<&str>) -> QualityWindow {
        if spectrum.is_none() && model.is_none() {
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some((at, window)) = &state.cached_baseline
                    && at.elapsed() < self.config.cadence
                {
                    return window.clone();
                }
            }
            let window = self.window(self.config.baseline_window, None, None);
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.cached_baseline = Some((Instant::now(), window.clone()));
            return window;
        }
        self.window(self.config.baseline_window, spectrum, model)
    }

    /// Distinct (model, spectrum) pairs seen in the live window.
    pub fn active_keys(&self) -> Vec<(String, Spectrum)> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.live_window)
                .unwrap_or(chrono::Duration::hours(1));
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<(String, Spectrum)> = state
            .records
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .map(|r| (r.model.clone(), r.spectrum))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Hourly mean-score series over the retained history, oldest first.
    /// Feeds the forecasting capability.
    pub fn hourly_series(&self) -> Vec<(DateTime<Utc>, f64)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut hours: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
        for record in &state.records {
            let hour = record
                .timestamp
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(record.timestamp);
            let entry = hours.entry(hour).or_insert((0.0, 0));
            entry.0 += record.score;
            entry.1 += 1;
        }
        hours
            .into_iter()
            .map(|(hour, (sum, n))| (hour, sum / n as f64))
            .collect()
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
