//! Bulk analytics: per-(model, spectrum, day) rollups built from
//! backend bulk exports.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{CapabilityError, ObservabilityError};
use crate::observability::{ExportFormat, ExportStatus, RunQuery, RunRecord, TraceBackend};

/// Polling attempts before an export is considered stuck.
const POLL_ATTEMPTS: u32 = 20;

/// Delay between export polls.
const POLL_DELAY: Duration = Duration::from_millis(500);

/// One day's aggregate for a (model, spectrum) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRollup {
    pub model: String,
    pub spectrum: String,
    pub day: NaiveDate,
    pub count: u64,
    pub mean_score: f64,
    pub p95_latency_ms: u64,
    pub error_rate: f64,
    pub cost_estimate: Decimal,
}

/// Schedules exports and aggregates them into daily rollups.
///
/// Rollups are idempotent: a completed day is cached, and re-running it
/// returns the cached aggregates without touching the backend again.
pub struct RollupEngine {
    backend: Arc<dyn TraceBackend>,
    cost_per_token: Decimal,
    completed: Mutex<CompletedDays>,
}

#[derive(Default)]
struct CompletedDays {
    days: HashSet<NaiveDate>,
    rollups: BTreeMap<(String, String, NaiveDate), DailyRollup>,
}

impl RollupEngine {
    pub fn new(backend: Arc<dyn TraceBackend>, cost_per_token: Decimal) -> Self {
        Self {
            backend,
            cost_per_token,
            completed: Mutex::new(CompletedDays::default()),
        }
    }

    /// Produce rollups for one day. Already-completed days return their
    /// cached aggregates unchanged.
    pub async fn run_for_day(&self, day: NaiveDate) -> Result<Vec<DailyRollup>, CapabilityError> {
        {
            let completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
            if completed.days.contains(&day) {
                return Ok(completed
                    .rollups
                    .iter()
                    .filter(|((_, _, d), _)| *d == day)
                    .map(|(_, rollup)| rollup.clone())
                    .collect());
            }
        }

        let runs = self.export_day(day).await?;
        let rollups = aggregate(&runs, day, self.cost_per_token);

        let mut completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
        completed.days.insert(day);
        for rollup in &rollups {
            completed.rollups.insert(
                (rollup.model.clone(), rollup.spectrum.clone(), day),
                rollup.clone(),
            );
        }
        Ok(rollups)
    }

    async fn export_day(&self, day: NaiveDate) -> Result<Vec<RunRecord>, CapabilityError> {
        let start = Utc
            .from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default());
        let end = start + chrono::Duration::days(1);
        let query = RunQuery {
            since: Some(start),
            until: Some(end),
            limit: 100,
            ..RunQuery::default()
        };

        let export_id = self
            .backend
            .start_bulk_export(query, ExportFormat::Ndjson)
            .await?;

        for _ in 0..POLL_ATTEMPTS {
            match self.backend.poll_bulk_export(&export_id).await? {
                ExportStatus::Ready { url } => {
                    return Ok(self.backend.fetch_export(&url).await?);
                }
                ExportStatus::Failed { error } => {
                    return Err(CapabilityError::Backend(ObservabilityError::Transient {
                        reason: format!("export {export_id} failed: {error}"),
                    }));
                }
                ExportStatus::Pending => tokio::time::sleep(POLL_DELAY).await,
            }
        }
        Err(CapabilityError::Backend(ObservabilityError::Transient {
            reason: format!("export {export_id} still pending after {POLL_ATTEMPTS} polls"),
        }))
    }
}

fn aggregate(runs: &[RunRecord], day: NaiveDate, cost_per_token: Decimal) -> Vec<DailyRollup> {
    let mut groups: BTreeMap<(String, String), Vec<&RunRecord>> = BTreeMap::new();
    for run in runs {
        let model = run.model.clone().unwrap_or_else(|| "unknown".into());
        let spectrum = run
            .spectrum
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "unknown".into());
        groups.entry((model, spectrum)).or_default().push(run);
    }

    groups
        .into_iter()
        .map(|((model, spectrum), runs)| {
            let count = runs.len() as u64;
            let scores: Vec<f64> = runs.iter().filter_map(|r| r.feedback_score).collect();
            let mean_score = if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            };
            let mut latencies: Vec<u64> = runs.iter().map(|r| r.latency_ms).collect();
            latencies.sort_unstable();
            let rank = ((latencies.len() as f64) * 0.95).ceil() as usize;
            let p95_latency_ms = latencies[rank.clamp(1, latencies.len()) - 1];
            let errors = runs.iter().filter(|r| r.error.is_some()).count();
            let tokens: u64 = runs.iter().map(|r| u64::from(r.total_tokens)).sum();

            DailyRollup {
                model,
                spectrum,
                day,
                count,
                mean_score,
                p95_latency_ms,
                error_rate: errors as f64 / runs.len() as f64,
                cost_estimate: Decimal::from(tokens) * cost_per_token,
            }
        })
        .collect()
}
