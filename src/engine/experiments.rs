//! A/B testing framework with deterministic allocation and Welch-tested
//! conclusions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::stats::{SampleStats, welch_t_test};
use crate::error::CycleError;
use crate::quality::QualityRecord;
use crate::trace::Spectrum;

/// Retained concluded experiments.
const HISTORY_CAP: usize = 64;

/// Bounded trace-to-arm attribution ledger.
const ATTRIBUTION_CAP: usize = 10_000;

/// Which variant served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Control,
    Treatment,
}

/// Experiment lifecycle. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    ConcludedWinnerControl,
    ConcludedWinnerTreatment,
    ConcludedInconclusive,
    Aborted,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExperimentStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Running => "running",
            ExperimentStatus::ConcludedWinnerControl => "concluded_winner_control",
            ExperimentStatus::ConcludedWinnerTreatment => "concluded_winner_treatment",
            ExperimentStatus::ConcludedInconclusive => "concluded_inconclusive",
            ExperimentStatus::Aborted => "aborted",
        }
    }
}

/// Decision parameters, taken from the optimization config.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Minimum samples per arm before any conclusion.
    pub min_samples: usize,
    /// Two-sided significance threshold.
    pub alpha: f64,
    /// Hard timeout after which the experiment concludes inconclusive.
    pub max_duration: Duration,
}

/// One A/B comparison between a control and a treatment variant.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub experiment_id: Uuid,
    pub model: String,
    pub spectrum: Spectrum,
    pub control_variant_id: Uuid,
    pub treatment_variant_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Percentage of traffic sent to treatment, clamped to 10..=50.
    pub treatment_share: u8,
    pub allocations: u64,
    pub control_allocations: u64,
    pub treatment_allocations: u64,
    control_scores: Vec<f64>,
    treatment_scores: Vec<f64>,
    pub status: ExperimentStatus,
}

impl Experiment {
    pub fn new(
        model: impl Into<String>,
        spectrum: Spectrum,
        control_variant_id: Uuid,
        treatment_variant_id: Uuid,
        treatment_share: u8,
    ) -> Self {
        Self {
            experiment_id: Uuid::new_v4(),
            model: model.into(),
            spectrum,
            control_variant_id,
            treatment_variant_id,
            started_at: Utc::now(),
            ended_at: None,
            treatment_share: treatment_share.clamp(10, 50),
            allocations: 0,
            control_allocations: 0,
            treatment_allocations: 0,
            control_scores: Vec::new(),
            treatment_scores: Vec::new(),
            status: ExperimentStatus::Running,
        }
    }

    /// Deterministic allocation: the same request fingerprint always
    /// lands in the same arm.
    pub fn allocate(&mut self, fingerprint: u64) -> Arm {
        let arm = if (fingerprint % 100) < u64::from(self.treatment_share) {
            Arm::Treatment
        } else {
            Arm::Control
        };
        self.allocations += 1;
        match arm {
            Arm::Control => self.control_allocations += 1,
            Arm::Treatment => self.treatment_allocations += 1,
        }
        arm
    }

    pub fn record_score(&mut self, arm: Arm, score: f64) {
        match arm {
            Arm::Control => self.control_scores.push(score),
            Arm::Treatment => self.treatment_scores.push(score),
        }
    }

    pub fn sample_counts(&self) -> (usize, usize) {
        (self.control_scores.len(), self.treatment_scores.len())
    }

    pub fn means(&self) -> (Option<f64>, Option<f64>) {
        let mean = |scores: &[f64]| {
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64)
        };
        (mean(&self.control_scores), mean(&self.treatment_scores))
    }

    /// Evaluate the decision rule. Below the per-arm admission gate no
    /// conclusion is possible; past the hard timeout the experiment
    /// concludes inconclusive. Calling after a terminal transition
    /// returns the settled status unchanged.
    pub fn decide(&mut self, config: &DecisionConfig, now: DateTime<Utc>) -> ExperimentStatus {
        if self.status.is_terminal() {
            return self.status;
        }

        let timed_out = (now - self.started_at).to_std().unwrap_or_default()
            >= config.max_duration;

        let (control_n, treatment_n) = self.sample_counts();
        if control_n < config.min_samples || treatment_n < config.min_samples {
            if timed_out {
                self.conclude(ExperimentStatus::ConcludedInconclusive, now);
            }
            return self.status;
        }

        let control = SampleStats::from_slice(&self.control_scores);
        let treatment = SampleStats::from_slice(&self.treatment_scores);
        if let Some(result) = welch_t_test(&treatment, &control)
            && result.p_value <= config.alpha
        {
            let status = if treatment.mean > control.mean {
                ExperimentStatus::ConcludedWinnerTreatment
            } else {
                ExperimentStatus::ConcludedWinnerControl
            };
            self.conclude(status, now);
            return self.status;
        }

        if timed_out {
            self.conclude(ExperimentStatus::ConcludedInconclusive, now);
        }
        self.status
    }

    /// External cancellation. Only a running experiment can abort.
    pub fn abort(&mut self) -> Result<(), CycleError> {
        if self.status.is_terminal() {
            return Err(CycleError::ExperimentConcluded {
                experiment_id: self.experiment_id,
                status: self.status.as_str().to_string(),
            });
        }
        self.conclude(ExperimentStatus::Aborted, Utc::now());
        Ok(())
    }

    fn conclude(&mut self, status: ExperimentStatus, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
    }
}

/// Summary for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub experiment_id: Uuid,
    pub model: String,
    pub spectrum: Spectrum,
    pub status: &'static str,
    pub control_samples: usize,
    pub treatment_samples: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

fn summarize(experiment: &Experiment) -> ExperimentSummary {
    let (control_samples, treatment_samples) = experiment.sample_counts();
    ExperimentSummary {
        experiment_id: experiment.experiment_id,
        model: experiment.model.clone(),
        spectrum: experiment.spectrum,
        status: experiment.status.as_str(),
        control_samples,
        treatment_samples,
        started_at: experiment.started_at,
        ended_at: experiment.ended_at,
    }
}

struct BoardState {
    active: HashMap<(String, Spectrum), Experiment>,
    /// trace_id → (key, arm) for score attribution.
    attribution: HashMap<Uuid, ((String, Spectrum), Arm)>,
    attribution_order: VecDeque<Uuid>,
    history: VecDeque<Experiment>,
}

/// All experiments, active and concluded. The single mutation point for
/// experiment state.
pub struct ExperimentBoard {
    state: Mutex<BoardState>,
}

impl Default for ExperimentBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentBoard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState {
                active: HashMap::new(),
                attribution: HashMap::new(),
                attribution_order: VecDeque::new(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Register a new experiment. One active experiment per key.
    pub fn begin(&self, experiment: Experiment) -> Result<Uuid, CycleError> {
        let key = (experiment.model.clone(), experiment.spectrum);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.active.contains_key(&key) {
            return Err(CycleError::AlreadyInFlight {
                model: key.0,
                spectrum: key.1,
            });
        }
        let id = experiment.experiment_id;
        state.active.insert(key, experiment);
        Ok(id)
    }

    /// Allocate a request to an arm, returning the variant to apply.
    /// `None` when no experiment is active for the key.
    pub fn allocate(&self, model: &str, spectrum: Spectrum, fingerprint: u64) -> Option<(Uuid, Arm)> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let experiment = state.active.get_mut(&(model.to_string(), spectrum))?;
        let arm = experiment.allocate(fingerprint);
        let variant = match arm {
            Arm::Control => experiment.control_variant_id,
            Arm::Treatment => experiment.treatment_variant_id,
        };
        Some((variant, arm))
    }

    /// Tie a dispatched trace to its allocated arm so the quality record
    /// can be attributed later.
    pub fn attribute(&self, trace_id: Uuid, model: &str, spectrum: Spectrum, arm: Arm) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.attribution_order.len() >= ATTRIBUTION_CAP
            && let Some(oldest) = state.attribution_order.pop_front()
        {
            state.attribution.remove(&oldest);
        }
        state
            .attribution
            .insert(trace_id, ((model.to_string(), spectrum), arm));
        state.attribution_order.push_back(trace_id);
    }

    /// Route a quality record to its experiment arm, if attributed.
    pub fn record(&self, record: &QualityRecord) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some((key, arm)) = state.attribution.remove(&record.trace_id) else {
            return;
        };
        if let Some(experiment) = state.active.get_mut(&key) {
            experiment.record_score(arm, record.score);
        }
    }

    /// Run the decision rule for one key.
    pub fn decide(
        &self,
        model: &str,
        spectrum: Spectrum,
        config: &DecisionConfig,
    ) -> Option<ExperimentStatus> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let experiment = state.active.get_mut(&(model.to_string(), spectrum))?;
        Some(experiment.decide(config, Utc::now()))
    }

    /// Remove a concluded experiment, archiving it to bounded history.
    /// Running experiments stay put.
    pub fn take_concluded(&self, model: &str, spectrum: Spectrum) -> Option<Experiment> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (model.to_string(), spectrum);
        let terminal = state
            .active
            .get(&key)
            .is_some_and(|e| e.status.is_terminal());
        if !terminal {
            return None;
        }
        let experiment = state.active.remove(&key)?;
        if state.history.len() >= HISTORY_CAP {
            state.history.pop_front();
        }
        state.history.push_back(experiment.clone());
        Some(experiment)
    }

    /// Abort the active experiment for a key, if any.
    pub fn abort(&self, model: &str, spectrum: Spectrum) -> Result<(), CycleError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = (model.to_string(), spectrum);
        match state.active.get_mut(&key) {
            Some(experiment) => experiment.abort(),
            None => Ok(()),
        }
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active.len()
    }

    pub fn summaries(&self) -> Vec<ExperimentSummary> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .active
            .values()
            .chain(state.history.iter())
            .map(summarize)
            .collect()
    }
}
