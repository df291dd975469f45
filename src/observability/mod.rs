//! Client for the external trace/feedback/dataset backend.
//!
//! The backend owns all durable history: runs, feedback, datasets,
//! annotation queues, and bulk exports. Everything in this process is
//! bounded and transient; anything worth keeping goes through here.
//!
//! [`TraceBackend`] is the seam: the capability engine and the cycle
//! manager depend on the trait, the HTTPS client implements it, and
//! [`memory::InMemoryBackend`] backs tests and offline development.

mod client;
pub mod memory;
mod types;

pub use client::ObservabilityClient;
pub use types::{
    AggregateStats, AnnotationItem, AnnotationQueueInfo, DatasetExample, ExportFormat,
    ExportStatus, GroupBy, GroupStats, RunPage, RunQuery, RunRecord, WorkspaceStats,
};

use async_trait::async_trait;

use crate::error::ObservabilityError;

/// Async surface over the trace backend. All calls are cancellable at
/// their network suspension points and honor the configured timeouts.
#[async_trait]
pub trait TraceBackend: Send + Sync {
    /// Paginate runs. Results order by `created_at` descending unless
    /// `since` is set, in which case ascending. At most `limit` items per
    /// page (server cap 100).
    async fn list_runs(&self, query: RunQuery) -> Result<RunPage, ObservabilityError>;

    async fn get_run_stats(
        &self,
        session: Option<&str>,
        group_by: GroupBy,
    ) -> Result<AggregateStats, ObservabilityError>;

    async fn submit_feedback(
        &self,
        run_id: &str,
        score: f64,
        comment: Option<&str>,
    ) -> Result<(), ObservabilityError>;

    async fn create_dataset(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, ObservabilityError>;

    async fn add_examples(
        &self,
        dataset_id: &str,
        examples: &[DatasetExample],
    ) -> Result<usize, ObservabilityError>;

    async fn start_bulk_export(
        &self,
        query: RunQuery,
        format: ExportFormat,
    ) -> Result<String, ObservabilityError>;

    async fn poll_bulk_export(&self, export_id: &str) -> Result<ExportStatus, ObservabilityError>;

    /// Download a ready export and parse its run records.
    async fn fetch_export(&self, url: &str) -> Result<Vec<RunRecord>, ObservabilityError>;

    async fn list_annotation_queues(&self)
    -> Result<Vec<AnnotationQueueInfo>, ObservabilityError>;

    async fn enqueue_annotation(
        &self,
        queue_id: &str,
        item: AnnotationItem,
    ) -> Result<(), ObservabilityError>;

    async fn workspace_stats(&self) -> Result<WorkspaceStats, ObservabilityError>;
}
