//! The virtuous cycle manager: four concurrent loops over the quality
//! pipeline.
//!
//! | Loop           | Cadence    | Work                                        |
//! |----------------|------------|---------------------------------------------|
//! | TraceIngest    | continuous | drain trace queue into the collector        |
//! | QualityMonitor | 30 s       | window snapshots, delta analysis, alerts    |
//! | Optimizer      | triggered  | full optimization cycles, one per key       |
//! | Processor      | 60 s       | feedback flush, forecasts, rollups          |
//!
//! Every loop parks in `tokio::select!` on a shared shutdown watch; on
//! shutdown the manager drains for five seconds, then aborts stragglers
//! with a logged warning.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;

use super::alerts::{AlertLedger, AlertSeverity};
use super::optimizer;
use super::queue::{TraceEnvelope, TraceQueue};
use crate::config::{OptimizationConfig, QualityConfig};
use crate::engine::{
    AnnotationRouter, CapabilityEngine, Experiment, ExperimentStatus, StrategySnapshot,
};
use crate::error::{CapabilityError, CycleError};
use crate::gateway::VariantStore;
use crate::monitor::OperationMonitor;
use crate::quality::QualityCollector;
use crate::trace::Spectrum;

/// Housekeeping-loop cadence.
const PROCESSOR_CADENCE: Duration = Duration::from_secs(60);

/// Shutdown drain budget before loops are aborted.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Experiment wrap-up grace beyond the hard timeout.
const CYCLE_GRACE: Duration = Duration::from_secs(15 * 60);

/// Pending optimization triggers. Excess triggers coalesce via the
/// in-flight set, so a small buffer suffices.
const TRIGGER_BUFFER: usize = 32;

/// A request to run one optimization cycle.
#[derive(Debug, Clone)]
pub struct OptimizationTrigger {
    pub model: String,
    pub spectrum: Spectrum,
    pub reason: String,
}

#[derive(Default)]
struct Metrics {
    traces_processed: AtomicU64,
    quality_checks: AtomicU64,
    optimizations_triggered: AtomicU64,
    improvements_deployed: AtomicU64,
    current_quality: Mutex<f64>,
    last_update: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Default)]
struct OptState {
    in_flight: HashSet<(String, Spectrum)>,
    cooldown_until: HashMap<(String, Spectrum), Instant>,
    breach_streaks: HashMap<(String, Spectrum), u32>,
}

/// Process-lifetime counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CycleMetricsSnapshot {
    pub traces_processed: u64,
    pub quality_checks: u64,
    pub optimizations_triggered: u64,
    pub improvements_deployed: u64,
    pub current_quality: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub traces_dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStatus {
    pub monitoring_active: bool,
    pub metrics: CycleMetricsSnapshot,
    pub component_status: serde_json::Value,
}

/// The concurrency core. Owns the loops and all cycle state; everything
/// else is injected.
pub struct VirtuousCycleManager {
    collector: Arc<QualityCollector>,
    engine: Arc<CapabilityEngine>,
    variants: Arc<VariantStore>,
    alerts: Arc<AlertLedger>,
    monitor: Arc<OperationMonitor>,
    queue: Arc<TraceQueue>,
    optimization: OptimizationConfig,
    quality: QualityConfig,
    metrics: Metrics,
    opt_state: Mutex<OptState>,
    cpu_pool: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    trigger_tx: mpsc::Sender<OptimizationTrigger>,
    trigger_rx: Mutex<Option<mpsc::Receiver<OptimizationTrigger>>>,
    tasks: Mutex<JoinSet<()>>,
    monitoring_active: AtomicBool,
}

impl VirtuousCycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collector: Arc<QualityCollector>,
        engine: Arc<CapabilityEngine>,
        variants: Arc<VariantStore>,
        alerts: Arc<AlertLedger>,
        monitor: Arc<OperationMonitor>,
        queue: Arc<TraceQueue>,
        optimization: OptimizationConfig,
        quality: QualityConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUFFER);
        let cpu_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .min(8);
        Arc::new(Self {
            collector,
            engine,
            variants,
            alerts,
            monitor,
            queue,
            optimization,
            quality,
            metrics: Metrics::default(),
            opt_state: Mutex::new(OptState::default()),
            cpu_pool: Arc::new(Semaphore::new(cpu_workers)),
            shutdown,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            tasks: Mutex::new(JoinSet::new()),
            monitoring_active: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &Arc<TraceQueue> {
        &self.queue
    }

    /// Spawn the four loops. Idempotent per process: the optimizer
    /// receiver can only be taken once.
    pub fn start(self: &Arc<Self>) {
        let Some(trigger_rx) = self
            .trigger_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            tracing::warn!("virtuous cycle manager already started");
            return;
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.spawn(Arc::clone(self).trace_ingest_loop());
        tasks.spawn(Arc::clone(self).quality_monitor_loop());
        tasks.spawn(Arc::clone(self).optimizer_loop(trigger_rx));
        tasks.spawn(Arc::clone(self).processor_loop());
        self.monitoring_active.store(true, Ordering::Relaxed);
        tracing::info!("virtuous cycle loops started");
    }

    /// Cooperative shutdown: signal, drain, then abort stragglers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.monitoring_active.store(false, Ordering::Relaxed);

        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = tasks.len(),
                        "cycle loops did not drain within {DRAIN_DEADLINE:?}, aborting"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
        tracing::info!("virtuous cycle loops stopped");
    }

    // ------------------------------------------------------------------
    // TraceIngest
    // ------------------------------------------------------------------

    async fn trace_ingest_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                envelope = self.queue.pop() => self.process_envelope(envelope).await,
            }
        }
        // Drain what is already queued; the shutdown deadline bounds us.
        while let Some(envelope) = self.queue.try_pop() {
            self.process_envelope(envelope).await;
        }
    }

    async fn process_envelope(&self, envelope: TraceEnvelope) {
        let record = match self.collector.ingest(&envelope.trace) {
            Ok(record) => record,
            Err(err) => {
                self.monitor.increment("traces_rejected_total");
                tracing::debug!(error = %err, "trace rejected at ingest");
                return;
            }
        };
        self.metrics.traces_processed.fetch_add(1, Ordering::Relaxed);

        // Per-record capability fanout.
        self.engine.board().record(&record);
        self.engine.patterns().admit(&record, &envelope.input);
        if envelope.trace.feedback_score.is_some() {
            self.engine
                .feedback()
                .offer(&record, &envelope.input, &envelope.output);
        }
        if AnnotationRouter::qualifies(&envelope.trace, &record)
            && let Err(err) = self
                .engine
                .annotations()
                .consider(&envelope.trace, &record, &envelope.input)
                .await
        {
            self.monitor.increment("annotation_errors_total");
            if err.is_retryable() {
                tracing::warn!(error = %err, "annotation enqueue failed, candidate lost");
            } else {
                tracing::error!(error = %err, "annotation enqueue failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // QualityMonitor
    // ------------------------------------------------------------------

    async fn quality_monitor_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        // Interval periods must be non-zero; tests use a zero cadence to
        // disable snapshot caching and drive ticks by hand.
        let cadence = self.quality.cadence.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.quality_tick(),
            }
        }
    }

    /// One monitoring pass. Public so operational tooling and tests can
    /// run a check outside the 30-second cadence.
    pub fn quality_tick(&self) {
        self.metrics.quality_checks.fetch_add(1, Ordering::Relaxed);
        let live = self.collector.snapshot(None, None);
        let baseline = self.collector.baseline(None, None);
        {
            let mut current = self
                .metrics
                .current_quality
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *current = live.mean;
        }
        {
            let mut last = self
                .metrics
                .last_update
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *last = Some(Utc::now());
        }

        let active = self.collector.active_keys();

        match self.engine.run_regression(&live, &baseline) {
            Ok(Some(analysis)) => {
                let severity = if analysis.magnitude >= 0.15 {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::High
                };
                self.alerts.emit(
                    severity,
                    "quality_regression",
                    "global",
                    format!(
                        "live mean {:.3} below baseline (magnitude {:.3}, p {:.4})",
                        live.mean, analysis.magnitude, analysis.p_value
                    ),
                );
                for (model, spectrum) in optimizer::regression_keys(&analysis, &active) {
                    let reason = format!(
                        "regression: magnitude {:.3}, p {:.4}",
                        analysis.magnitude, analysis.p_value
                    );
                    if let Err(err) = self.request_optimization(&model, spectrum, &reason) {
                        tracing::debug!(
                            error = %err,
                            model,
                            spectrum = %spectrum,
                            "optimization request declined"
                        );
                    }
                }
            }
            Ok(None) => {}
            Err(CapabilityError::InsufficientData { needed, have }) => {
                tracing::debug!(needed, have, "regression analysis skipped");
            }
            Err(err) => {
                self.monitor.increment("capability_errors_total");
                tracing::error!(error = %err, "regression analysis failed");
            }
        }

        self.check_absolute_threshold(&active);
    }

    /// Absolute-floor trigger: live mean under target for three
    /// consecutive monitoring windows fires an optimization for the key.
    fn check_absolute_threshold(&self, active: &[(String, Spectrum)]) {
        for (model, spectrum) in active {
            let window = self.collector.snapshot(Some(*spectrum), Some(model));
            let breached = window.count > 0 && window.mean < self.quality.threshold_target;
            let key = (model.clone(), *spectrum);

            let fire = {
                let mut state = self.opt_state.lock().unwrap_or_else(|e| e.into_inner());
                if breached {
                    let streak = state.breach_streaks.entry(key.clone()).or_insert(0);
                    *streak += 1;
                    if *streak >= self.optimization.sustained_windows {
                        *streak = 0;
                        true
                    } else {
                        false
                    }
                } else {
                    state.breach_streaks.remove(&key);
                    false
                }
            };

            if fire {
                let key_str = format!("{model}/{spectrum}");
                self.alerts.emit(
                    AlertSeverity::Medium,
                    "quality_below_target",
                    &key_str,
                    format!(
                        "live mean {:.3} under target {:.2} for {} windows",
                        window.mean, self.quality.threshold_target, self.optimization.sustained_windows
                    ),
                );
                let reason = format!("sustained live mean {:.3} below target", window.mean);
                if let Err(err) = self.request_optimization(model, *spectrum, &reason) {
                    tracing::debug!(error = %err, key = %key_str, "optimization request declined");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Optimizer
    // ------------------------------------------------------------------

    /// Ask for an optimization cycle. Declines when the key is already
    /// in flight, cooling down, or the global concurrency cap is hit.
    pub fn request_optimization(
        &self,
        model: &str,
        spectrum: Spectrum,
        reason: &str,
    ) -> Result<(), CycleError> {
        let key = (model.to_string(), spectrum);
        {
            let mut state = self.opt_state.lock().unwrap_or_else(|e| e.into_inner());
            if state.in_flight.contains(&key) {
                return Err(CycleError::AlreadyInFlight {
                    model: key.0,
                    spectrum,
                });
            }
            if let Some(until) = state.cooldown_until.get(&key) {
                let now = Instant::now();
                if now < *until {
                    return Err(CycleError::CooldownActive {
                        model: key.0,
                        spectrum,
                        remaining: *until - now,
                    });
                }
            }
            if state.in_flight.len() >= self.optimization.max_concurrent {
                return Err(CycleError::AtCapacity {
                    max: self.optimization.max_concurrent,
                });
            }
            state.in_flight.insert(key.clone());
        }

        let trigger = OptimizationTrigger {
            model: model.to_string(),
            spectrum,
            reason: reason.to_string(),
        };
        if self.trigger_tx.try_send(trigger).is_err() {
            let mut state = self.opt_state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight.remove(&key);
            return Err(CycleError::AtCapacity {
                max: self.optimization.max_concurrent,
            });
        }
        Ok(())
    }

    /// Number of cycles currently in flight.
    pub fn in_flight(&self) -> usize {
        self.opt_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
            .len()
    }

    /// Whether a key is cooling down after a completed cycle.
    pub fn cooling_down(&self, model: &str, spectrum: Spectrum) -> bool {
        let state = self.opt_state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .cooldown_until
            .get(&(model.to_string(), spectrum))
            .is_some_and(|until| Instant::now() < *until)
    }

    async fn optimizer_loop(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<OptimizationTrigger>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                trigger = trigger_rx.recv() => match trigger {
                    Some(trigger) => {
                        let manager = Arc::clone(&self);
                        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                        tasks.spawn(async move { manager.run_cycle(trigger).await });
                    }
                    None => break,
                },
            }
        }
    }

    async fn run_cycle(self: Arc<Self>, trigger: OptimizationTrigger) {
        let key = (trigger.model.clone(), trigger.spectrum);
        self.metrics
            .optimizations_triggered
            .fetch_add(1, Ordering::Relaxed);

        let timer = self.monitor.start_timer("cycle.optimization");
        let outcome = self.execute_cycle(&trigger).await;
        self.monitor.end_timer(timer, outcome.is_ok());
        if let Err(err) = outcome {
            tracing::error!(
                error = %err,
                model = %trigger.model,
                spectrum = %trigger.spectrum,
                "optimization cycle failed"
            );
        }

        // Cooldown applies regardless of outcome.
        let mut state = self.opt_state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.remove(&key);
        state
            .cooldown_until
            .insert(key, Instant::now() + self.optimization.cooldown);
    }

    async fn execute_cycle(&self, trigger: &OptimizationTrigger) -> Result<(), CycleError> {
        let model = trigger.model.as_str();
        let spectrum = trigger.spectrum;

        // Detect → consult patterns → select strategy → experiment.
        let parent = self.variants.ensure_deployed(model, spectrum);
        let exemplars = self.engine.patterns().top(spectrum, 3);
        let strategy = self
            .engine
            .strategies()
            .select()
            .ok_or_else(|| CycleError::Invariant {
                detail: "strategy book is empty".to_string(),
            })?;

        let candidate = optimizer::build_candidate(&strategy, &parent, &exemplars);
        let treatment_id = candidate.variant_id;
        self.variants.register_candidate(candidate);
        self.engine.strategies().mark_applied(strategy.strategy_id);
        for exemplar in &exemplars {
            self.engine.patterns().mark_applied(exemplar.pattern_id);
        }

        let experiment = Experiment::new(model, spectrum, parent.variant_id, treatment_id, 50);
        self.engine.board().begin(experiment)?;
        tracing::info!(
            model,
            spectrum = %spectrum,
            strategy = ?strategy.kind,
            reason = %trigger.reason,
            "optimization cycle started"
        );

        // Await a terminal decision, bounded by max duration plus grace.
        let deadline = Instant::now() + self.optimization.ab_max_duration + CYCLE_GRACE;
        let poll = self.quality.cadence.max(Duration::from_millis(10));
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.engine.board().abort(model, spectrum)?;
                }
                _ = tokio::time::sleep(poll) => {}
            }
            if Instant::now() >= deadline {
                tracing::warn!(model, spectrum = %spectrum, "cycle deadline exceeded, aborting experiment");
                self.engine.board().abort(model, spectrum)?;
            }
            match self
                .engine
                .board()
                .decide(model, spectrum, self.engine.decision_config())
            {
                Some(status) if status.is_terminal() => break,
                Some(_) => continue,
                None => return Ok(()),
            }
        }

        let Some(experiment) = self.engine.board().take_concluded(model, spectrum) else {
            return Ok(());
        };
        self.settle(&experiment, &strategy)
    }

    /// Promote or archive based on the experiment outcome, and teach the
    /// strategy book what happened.
    fn settle(
        &self,
        experiment: &Experiment,
        strategy: &StrategySnapshot,
    ) -> Result<(), CycleError> {
        let (control_mean, treatment_mean) = experiment.means();
        let delta = match (control_mean, treatment_mean) {
            (Some(control), Some(treatment)) => treatment - control,
            _ => 0.0,
        };
        let key_str = format!("{}/{}", experiment.model, experiment.spectrum);

        match experiment.status {
            ExperimentStatus::ConcludedWinnerTreatment
                if delta >= self.optimization.min_success_delta =>
            {
                self.variants.promote(
                    &experiment.model,
                    experiment.spectrum,
                    experiment.treatment_variant_id,
                )?;
                self.metrics
                    .improvements_deployed
                    .fetch_add(1, Ordering::Relaxed);
                self.engine
                    .strategies()
                    .record_delta(strategy.strategy_id, delta);
                self.alerts.emit(
                    AlertSeverity::Info,
                    "variant_deployed",
                    &key_str,
                    format!("treatment improved mean quality by {delta:.3}"),
                );
                tracing::info!(key = %key_str, delta, "treatment variant deployed");
            }
            _ => {
                // Control win, inconclusive, aborted, or a win below the
                // deployment margin: keep control, archive treatment.
                self.variants.archive(experiment.treatment_variant_id)?;
                self.engine
                    .strategies()
                    .record_delta(strategy.strategy_id, delta.min(0.0));
                tracing::info!(
                    key = %key_str,
                    status = experiment.status.as_str(),
                    delta,
                    "treatment variant archived"
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processor
    // ------------------------------------------------------------------

    async fn processor_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(PROCESSOR_CADENCE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.processor_tick().await,
            }
        }
    }

    /// One housekeeping pass. Public so tests can drive it directly.
    pub async fn processor_tick(&self) {
        let timer = self.monitor.start_timer("cycle.processor");

        match self.engine.feedback().flush_if_due().await {
            Ok(0) => {}
            Ok(count) => self.monitor.add("feedback_committed_total", count as u64),
            Err(err) if err.is_retryable() => {
                tracing::warn!(error = %err, "feedback flush failed, retrying next tick");
            }
            Err(err) => {
                self.monitor.increment("capability_errors_total");
                tracing::error!(error = %err, "feedback flush failed");
            }
        }

        self.refresh_forecast().await;

        let yesterday = (Utc::now() - chrono::Duration::days(1)).date_naive();
        match self.engine.rollups().run_for_day(yesterday).await {
            Ok(_) => {}
            Err(err) if err.is_retryable() => {
                tracing::warn!(error = %err, day = %yesterday, "rollup deferred");
            }
            Err(err) => {
                self.monitor.increment("capability_errors_total");
                tracing::error!(error = %err, day = %yesterday, "rollup failed");
            }
        }

        if let Err(err) = self.engine.annotations().sync_pending().await {
            tracing::warn!(error = %err, "annotation queue sync failed");
        }

        self.monitor.end_timer(timer, true);
    }

    /// Forecast fitting is CPU-bound; run it on the blocking pool under
    /// the worker semaphore so the I/O loops stay responsive.
    async fn refresh_forecast(&self) {
        let series: Vec<f64> = self
            .collector
            .hourly_series()
            .into_iter()
            .map(|(_, mean)| mean)
            .collect();

        let Ok(permit) = Arc::clone(&self.cpu_pool).acquire_owned().await else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.refresh_forecast(&series)
        })
        .await;

        match result {
            Ok(Ok(points)) => tracing::debug!(points, "forecast refreshed"),
            Ok(Err(CapabilityError::InsufficientData { needed, have })) => {
                tracing::debug!(needed, have, "forecast skipped");
            }
            Ok(Err(err)) => {
                self.monitor.increment("capability_errors_total");
                tracing::error!(error = %err, "forecast refresh failed");
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "forecast task panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Status surface
    // ------------------------------------------------------------------

    pub fn status(&self) -> CycleStatus {
        let current_quality = *self
            .metrics
            .current_quality
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let last_update = *self
            .metrics
            .last_update
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        CycleStatus {
            monitoring_active: self.monitoring_active.load(Ordering::Relaxed),
            metrics: CycleMetricsSnapshot {
                traces_processed: self.metrics.traces_processed.load(Ordering::Relaxed),
                quality_checks: self.metrics.quality_checks.load(Ordering::Relaxed),
                optimizations_triggered: self
                    .metrics
                    .optimizations_triggered
                    .load(Ordering::Relaxed),
                improvements_deployed: self
                    .metrics
                    .improvements_deployed
                    .load(Ordering::Relaxed),
                current_quality,
                last_update,
                traces_dropped: self.queue.dropped(),
            },
            component_status: serde_json::json!({
                "collector": { "records": self.collector.len() },
                "patterns": { "indexed": self.engine.patterns().total() },
                "experiments": { "active": self.engine.board().active_count() },
                "forecast": { "available": self.engine.latest_forecast().is_some() },
                "trace_queue": { "depth": self.queue.len(), "dropped": self.queue.dropped() },
                "optimizations": { "in_flight": self.in_flight() },
            }),
        }
    }

    /// Manual trigger from the operational API. Picks the
    /// worst-performing live key; the usual cooldown and concurrency
    /// rules apply.
    pub fn trigger(&self, reason: &str) -> (bool, String) {
        let mut worst: Option<(String, Spectrum, f64)> = None;
        for (model, spectrum) in self.collector.active_keys() {
            let window = self.collector.snapshot(Some(spectrum), Some(&model));
            if window.count == 0 {
                continue;
            }
            if worst.as_ref().is_none_or(|(_, _, mean)| window.mean < *mean) {
                worst = Some((model, spectrum, window.mean));
            }
        }
        let Some((model, spectrum, mean)) = worst else {
            return (false, "no live traffic to optimize".to_string());
        };
        match self.request_optimization(&model, spectrum, reason) {
            Ok(()) => (
                true,
                format!("optimization started for {model}/{spectrum} (live mean {mean:.3})"),
            ),
            Err(err) => (false, err.to_string()),
        }
    }

    /// Recent alert history for the operational API.
    pub fn alerts(&self) -> &AlertLedger {
        &self.alerts
    }

    /// Active and recent experiments for the operational API.
    pub fn experiments(&self) -> Vec<crate::engine::ExperimentSummary> {
        self.engine.board().summaries()
    }

    /// Variant deployment history for the operational API.
    pub fn variants(&self) -> &VariantStore {
        &self.variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForecastConfig, ScoreWeights};
    use crate::observability::memory::InMemoryBackend;
    use crate::trace::TraceRecord;

    fn quality_config() -> QualityConfig {
        QualityConfig {
            threshold_target: 0.90,
            regression_delta: 0.05,
            weights: ScoreWeights::default(),
            slo_ms: 3_000,
            live_window: Duration::from_secs(3_600),
            baseline_window: Duration::from_secs(7 * 24 * 3_600),
            cadence: Duration::from_secs(0),
            cost_per_token: rust_decimal_macros::dec!(0.000002),
        }
    }

    fn optimization_config() -> OptimizationConfig {
        OptimizationConfig {
            max_concurrent: 3,
            cooldown: Duration::from_secs(3_600),
            ab_min_samples: 30,
            ab_max_duration: Duration::from_secs(7 * 24 * 3_600),
            ab_alpha: 0.05,
            min_success_delta: 0.02,
            sustained_windows: 3,
        }
    }

    fn manager() -> Arc<VirtuousCycleManager> {
        let backend = Arc::new(InMemoryBackend::new());
        let quality = quality_config();
        let optimization = optimization_config();
        let forecast = ForecastConfig {
            horizon_hours: 24,
            min_samples: 200,
        };
        let collector = Arc::new(QualityCollector::new(quality.clone()));
        let engine = Arc::new(CapabilityEngine::new(
            backend,
            &quality,
            &optimization,
            &forecast,
        ));
        VirtuousCycleManager::new(
            collector.clone(),
            engine,
            Arc::new(VariantStore::new()),
            Arc::new(AlertLedger::new(Duration::from_secs(900))),
            Arc::new(OperationMonitor::new()),
            Arc::new(TraceQueue::default()),
            optimization,
            quality,
        )
    }

    fn feed(manager: &VirtuousCycleManager, model: &str, spectrum: Spectrum, score: f64, n: usize) {
        for _ in 0..n {
            let trace =
                TraceRecord::new("s", model, spectrum, 100, 10, 10).with_feedback(score);
            manager.collector.ingest(&trace).unwrap();
        }
    }

    #[tokio::test]
    async fn request_optimization_is_single_flight_per_key() {
        let manager = manager();
        manager
            .request_optimization("m", Spectrum::Identity, "test")
            .unwrap();
        let err = manager
            .request_optimization("m", Spectrum::Identity, "test")
            .unwrap_err();
        assert!(matches!(err, CycleError::AlreadyInFlight { .. }));
        assert_eq!(manager.in_flight(), 1);
    }

    #[tokio::test]
    async fn global_concurrency_cap_applies() {
        let manager = manager();
        manager
            .request_optimization("m1", Spectrum::Identity, "t")
            .unwrap();
        manager
            .request_optimization("m2", Spectrum::Identity, "t")
            .unwrap();
        manager
            .request_optimization("m3", Spectrum::Identity, "t")
            .unwrap();
        let err = manager
            .request_optimization("m4", Spectrum::Identity, "t")
            .unwrap_err();
        assert!(matches!(err, CycleError::AtCapacity { max: 3 }));
    }

    #[tokio::test]
    async fn cooldown_declines_new_cycles() {
        let manager = manager();
        {
            let mut state = manager.opt_state.lock().unwrap();
            state.cooldown_until.insert(
                ("m".to_string(), Spectrum::Edge),
                Instant::now() + Duration::from_secs(600),
            );
        }
        let err = manager
            .request_optimization("m", Spectrum::Edge, "t")
            .unwrap_err();
        assert!(matches!(err, CycleError::CooldownActive { .. }));
        assert!(manager.cooling_down("m", Spectrum::Edge));
    }

    #[tokio::test]
    async fn sustained_breach_triggers_after_three_ticks() {
        let manager = manager();
        // Live mean 0.85 < 0.90 target; baseline too small for the
        // regression path, so only the absolute trigger can fire.
        feed(&manager, "gpt-4o-mini", Spectrum::Identity, 0.85, 10);

        manager.quality_tick();
        manager.quality_tick();
        assert_eq!(manager.in_flight(), 0);
        manager.quality_tick();
        assert_eq!(manager.in_flight(), 1, "third consecutive breach fires");

        let status = manager.status();
        assert_eq!(status.metrics.quality_checks, 3);
        assert!(status.metrics.current_quality < 0.90);
    }

    #[tokio::test]
    async fn healthy_traffic_resets_breach_streak() {
        let manager = manager();
        feed(&manager, "m", Spectrum::Identity, 0.85, 10);
        manager.quality_tick();
        manager.quality_tick();
        // Recovery: fresh healthy traffic lifts the live mean.
        feed(&manager, "m", Spectrum::Identity, 0.99, 200);
        manager.quality_tick();
        manager.quality_tick();
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn manual_trigger_reports_acceptance() {
        let manager = manager();
        let (accepted, reason) = manager.trigger("operator request");
        assert!(!accepted, "no live traffic: {reason}");

        feed(&manager, "m", Spectrum::Financial, 0.80, 5);
        let (accepted, _) = manager.trigger("operator request");
        assert!(accepted);
        assert_eq!(manager.in_flight(), 1);

        let (second, _) = manager.trigger("operator again");
        assert!(!second, "key already in flight");
    }

    #[tokio::test]
    async fn settle_promotes_clear_winner() {
        let manager = manager();
        let parent = manager.variants.ensure_deployed("m", Spectrum::Identity);
        let strategy = manager.engine.strategies().select().unwrap();
        let candidate = optimizer::build_candidate(&strategy, &parent, &[]);
        let treatment_id = candidate.variant_id;
        manager.variants.register_candidate(candidate);

        let mut experiment =
            Experiment::new("m", Spectrum::Identity, parent.variant_id, treatment_id, 50);
        for i in 0..40 {
            let jitter = if i % 2 == 0 { 0.05 } else { -0.05 };
            experiment.record_score(crate::engine::Arm::Treatment, 0.93 + jitter);
            experiment.record_score(crate::engine::Arm::Control, 0.90 + jitter);
        }
        let status = experiment.decide(manager.engine.decision_config(), Utc::now());
        assert_eq!(status, ExperimentStatus::ConcludedWinnerTreatment);

        manager.settle(&experiment, &strategy).unwrap();

        let deployed = manager.variants.deployed_for("m", Spectrum::Identity).unwrap();
        assert_eq!(deployed.variant_id, treatment_id);
        assert_eq!(manager.status().metrics.improvements_deployed, 1);
        let strategy_after = manager
            .engine
            .strategies()
            .snapshots()
            .into_iter()
            .find(|s| s.strategy_id == strategy.strategy_id)
            .unwrap();
        assert!(strategy_after.mean_delta > 0.0);
    }

    #[tokio::test]
    async fn settle_archives_inconclusive_treatment() {
        let manager = manager();
        let parent = manager.variants.ensure_deployed("m", Spectrum::Edge);
        let strategy = manager.engine.strategies().select().unwrap();
        let candidate = optimizer::build_candidate(&strategy, &parent, &[]);
        let treatment_id = candidate.variant_id;
        manager.variants.register_candidate(candidate);

        let mut experiment =
            Experiment::new("m", Spectrum::Edge, parent.variant_id, treatment_id, 50);
        experiment.abort().unwrap();
        manager.settle(&experiment, &strategy).unwrap();

        let deployed = manager.variants.deployed_for("m", Spectrum::Edge).unwrap();
        assert_eq!(deployed.variant_id, parent.variant_id);
        assert_eq!(manager.status().metrics.improvements_deployed, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_loops_within_deadline() {
        let manager = manager();
        manager.start();
        assert!(manager.status().monitoring_active);

        let started = Instant::now();
        manager.shutdown().await;
        assert!(started.elapsed() < DRAIN_DEADLINE + Duration::from_secs(1));
        assert!(!manager.status().monitoring_active);
    }

    #[tokio::test]
    async fn start_twice_is_harmless() {
        let manager = manager();
        manager.start();
        manager.start();
        manager.shutdown().await;
    }
}
