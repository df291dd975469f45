//! In-memory trace backend for tests and offline development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::types::{
    AggregateStats, AnnotationItem, AnnotationQueueInfo, DatasetExample, ExportFormat,
    ExportStatus, GroupBy, GroupStats, RunPage, RunQuery, RunRecord, WorkspaceStats,
};
use super::TraceBackend;
use crate::error::ObservabilityError;

#[derive(Default)]
struct MemoryState {
    runs: Vec<RunRecord>,
    feedback: Vec<(String, f64, Option<String>)>,
    datasets: HashMap<String, Vec<DatasetExample>>,
    exports: HashMap<String, RunQuery>,
    queues: HashMap<String, Vec<AnnotationItem>>,
}

/// Backend double holding everything in process memory.
///
/// Every operation behaves like the real backend at the contract level:
/// pagination respects cursors and ordering, exports become `Ready`
/// immediately, and feedback/examples are retained for assertions.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a run, oldest-first.
    pub fn push_run(&self, run: RunRecord) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.runs.push(run);
    }

    pub fn feedback_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .feedback
            .len()
    }

    pub fn dataset_examples(&self, dataset_id: &str) -> Vec<DatasetExample> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.datasets.get(dataset_id).cloned().unwrap_or_default()
    }

    pub fn queued_items(&self, queue_id: &str) -> Vec<AnnotationItem> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queues.get(queue_id).cloned().unwrap_or_default()
    }

    fn filtered(&self, query: &RunQuery) -> Vec<RunRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs: Vec<RunRecord> = state
            .runs
            .iter()
            .filter(|r| {
                query
                    .session
                    .as_ref()
                    .is_none_or(|s| r.session.as_deref() == Some(s.as_str()))
                    && query.since.is_none_or(|since| r.created_at >= since)
                    && query.until.is_none_or(|until| r.created_at <= until)
            })
            .cloned()
            .collect();
        if query.since.is_some() {
            runs.sort_by_key(|r| r.created_at);
        } else {
            runs.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        }
        runs
    }
}

#[async_trait]
impl TraceBackend for InMemoryBackend {
    async fn list_runs(&self, query: RunQuery) -> Result<RunPage, ObservabilityError> {
        let runs = self.filtered(&query);
        let offset: usize = query
            .cursor
            .as_deref()
            .map(|c| c.parse().unwrap_or(0))
            .unwrap_or(0);
        let limit = query.limit.clamp(1, 100);
        let page: Vec<RunRecord> = runs.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + page.len();
        let next_cursor = (next < runs.len()).then(|| next.to_string());
        Ok(RunPage {
            runs: page,
            next_cursor,
        })
    }

    async fn get_run_stats(
        &self,
        session: Option<&str>,
        group_by: GroupBy,
    ) -> Result<AggregateStats, ObservabilityError> {
        let query = RunQuery {
            session: session.map(str::to_string),
            limit: usize::MAX,
            ..RunQuery::default()
        };
        let runs = self.filtered(&query);

        let mut grouped: HashMap<String, Vec<&RunRecord>> = HashMap::new();
        for run in &runs {
            let key = match group_by {
                GroupBy::Model => run.model.clone().unwrap_or_else(|| "unknown".into()),
                GroupBy::Spectrum => run
                    .spectrum
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".into()),
                GroupBy::Hour => run.created_at.format("%Y-%m-%dT%H").to_string(),
                GroupBy::None => "all".to_string(),
            };
            grouped.entry(key).or_default().push(run);
        }

        let groups = grouped
            .into_iter()
            .map(|(key, runs)| {
                let count = runs.len() as u64;
                let errors = runs.iter().filter(|r| r.error.is_some()).count();
                let scores: Vec<f64> = runs.iter().filter_map(|r| r.feedback_score).collect();
                let mean_feedback = (!scores.is_empty())
                    .then(|| scores.iter().sum::<f64>() / scores.len() as f64);
                (
                    key,
                    GroupStats {
                        count,
                        mean_feedback,
                        error_rate: errors as f64 / runs.len().max(1) as f64,
                    },
                )
            })
            .collect();

        Ok(AggregateStats { groups })
    }

    async fn submit_feedback(
        &self,
        run_id: &str,
        score: f64,
        comment: Option<&str>,
    ) -> Result<(), ObservabilityError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.runs.iter().any(|r| r.id == run_id) {
            return Err(ObservabilityError::NotFound {
                resource: format!("run/{run_id}"),
            });
        }
        state
            .feedback
            .push((run_id.to_string(), score, comment.map(str::to_string)));
        Ok(())
    }

    async fn create_dataset(
        &self,
        name: &str,
        _description: Option<&str>,
    ) -> Result<String, ObservabilityError> {
        let id = format!("ds-{name}-{}", Uuid::new_v4().simple());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.datasets.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn add_examples(
        &self,
        dataset_id: &str,
        examples: &[DatasetExample],
    ) -> Result<usize, ObservabilityError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let dataset =
            state
                .datasets
                .get_mut(dataset_id)
                .ok_or_else(|| ObservabilityError::NotFound {
                    resource: format!("dataset/{dataset_id}"),
                })?;
        dataset.extend_from_slice(examples);
        Ok(examples.len())
    }

    async fn start_bulk_export(
        &self,
        query: RunQuery,
        _format: ExportFormat,
    ) -> Result<String, ObservabilityError> {
        let id = Uuid::new_v4().simple().to_string();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.exports.insert(id.clone(), query);
        Ok(id)
    }

    async fn poll_bulk_export(&self, export_id: &str) -> Result<ExportStatus, ObservabilityError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.exports.contains_key(export_id) {
            Ok(ExportStatus::Ready {
                url: format!("memory://exports/{export_id}"),
            })
        } else {
            Err(ObservabilityError::NotFound {
                resource: format!("export/{export_id}"),
            })
        }
    }

    async fn fetch_export(&self, url: &str) -> Result<Vec<RunRecord>, ObservabilityError> {
        let export_id =
            url.strip_prefix("memory://exports/")
                .ok_or_else(|| ObservabilityError::Protocol {
                    reason: format!("unexpected export url {url}"),
                })?;
        let query = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .exports
                .get(export_id)
                .cloned()
                .ok_or_else(|| ObservabilityError::NotFound {
                    resource: format!("export/{export_id}"),
                })?
        };
        Ok(self.filtered(&query))
    }

    async fn list_annotation_queues(
        &self,
    ) -> Result<Vec<AnnotationQueueInfo>, ObservabilityError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .queues
            .iter()
            .map(|(id, items)| AnnotationQueueInfo {
                id: id.clone(),
                name: id.clone(),
                pending: items.len(),
            })
            .collect())
    }

    async fn enqueue_annotation(
        &self,
        queue_id: &str,
        item: AnnotationItem,
    ) -> Result<(), ObservabilityError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queues.entry(queue_id.to_string()).or_default().push(item);
        Ok(())
    }

    async fn workspace_stats(&self) -> Result<WorkspaceStats, ObservabilityError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let day_ago = chrono::Utc::now() - chrono::Duration::hours(24);
        Ok(WorkspaceStats {
            projects: 1,
            datasets: state.datasets.len() as u64,
            repos: 0,
            runs_last_24h: state.runs.iter().filter(|r| r.created_at >= day_ago).count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::trace::Spectrum;

    fn run(id: &str, minutes_ago: i64) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            session: Some("s".into()),
            model: Some("gpt-4o-mini".into()),
            spectrum: Some(Spectrum::Identity),
            latency_ms: 100,
            total_tokens: 20,
            error: None,
            feedback_score: Some(0.9),
            created_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn list_runs_orders_desc_by_default() {
        let backend = InMemoryBackend::new();
        backend.push_run(run("old", 30));
        backend.push_run(run("new", 1));

        let page = backend.list_runs(RunQuery::new(10)).await.unwrap();
        assert_eq!(page.runs[0].id, "new");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn list_runs_orders_asc_with_since() {
        let backend = InMemoryBackend::new();
        backend.push_run(run("old", 30));
        backend.push_run(run("new", 1));

        let query = RunQuery {
            since: Some(Utc::now() - ChronoDuration::hours(1)),
            limit: 10,
            ..RunQuery::default()
        };
        let page = backend.list_runs(query).await.unwrap();
        assert_eq!(page.runs[0].id, "old");
    }

    #[tokio::test]
    async fn pagination_follows_cursor() {
        let backend = InMemoryBackend::new();
        for i in 0..5 {
            backend.push_run(run(&format!("r{i}"), i));
        }
        let first = backend.list_runs(RunQuery::new(2)).await.unwrap();
        assert_eq!(first.runs.len(), 2);
        let cursor = first.next_cursor.expect("more pages");

        let query = RunQuery {
            cursor: Some(cursor),
            limit: 2,
            ..RunQuery::default()
        };
        let second = backend.list_runs(query).await.unwrap();
        assert_eq!(second.runs.len(), 2);
        assert_ne!(first.runs[0].id, second.runs[0].id);
    }

    #[tokio::test]
    async fn feedback_requires_known_run() {
        let backend = InMemoryBackend::new();
        let err = backend.submit_feedback("ghost", 0.5, None).await.unwrap_err();
        assert!(matches!(err, ObservabilityError::NotFound { .. }));
    }

    #[tokio::test]
    async fn export_round_trip() {
        let backend = InMemoryBackend::new();
        backend.push_run(run("r1", 5));
        let export_id = backend
            .start_bulk_export(RunQuery::new(100), ExportFormat::Ndjson)
            .await
            .unwrap();
        let status = backend.poll_bulk_export(&export_id).await.unwrap();
        let ExportStatus::Ready { url } = status else {
            panic!("export should be ready immediately");
        };
        let runs = backend.fetch_export(&url).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn stats_group_by_model() {
        let backend = InMemoryBackend::new();
        backend.push_run(run("r1", 5));
        backend.push_run(run("r2", 6));
        let stats = backend.get_run_stats(None, GroupBy::Model).await.unwrap();
        assert_eq!(stats.groups["gpt-4o-mini"].count, 2);
    }
}
