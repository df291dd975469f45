//! Wire types for the trace backend API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trace::Spectrum;

/// One backend run, the durable mirror of a gateway trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectrum: Option<Spectrum>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Query parameters for run listing and bulk export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Backend filter expression, passed through opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl RunQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// One page of runs plus the cursor for the next page.
#[derive(Debug, Clone, Deserialize)]
pub struct RunPage {
    pub runs: Vec<RunRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Grouping key for aggregate stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Model,
    Spectrum,
    Hour,
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupStats {
    pub count: u64,
    pub mean_feedback: Option<f64>,
    pub error_rate: f64,
}

/// Aggregate run statistics, keyed by the requested grouping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregateStats {
    pub groups: BTreeMap<String, GroupStats>,
}

/// Output format for bulk exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Ndjson,
    Csv,
}

/// State of a bulk export job.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Ready { url: String },
    Failed { error: String },
}

/// One dataset example committed through feedback integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetExample {
    pub input: String,
    pub output: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectrum: Option<Spectrum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_run_id: Option<String>,
}

/// Annotation queue listing entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationQueueInfo {
    pub id: String,
    pub name: String,
    pub pending: usize,
}

/// One item queued for human annotation.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotationItem {
    pub run_id: String,
    pub model: String,
    pub spectrum: Spectrum,
    pub input: String,
    pub score: f64,
    pub reason: String,
}

/// Workspace-level counts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceStats {
    pub projects: u64,
    pub datasets: u64,
    pub repos: u64,
    pub runs_last_24h: u64,
}
