//! Feedback integration: map scored interactions onto training
//! exemplars and batch-commit them to a backend dataset.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::CapabilityError;
use crate::observability::{DatasetExample, TraceBackend};
use crate::quality::QualityRecord;

use super::patterns::PatternIndex;

/// Flush cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Flush when this many examples are pending, whichever comes first.
const FLUSH_BATCH: usize = 50;

/// Near-duplicate threshold against existing patterns.
const DEDUP_SIMILARITY: f32 = 0.98;

/// Dataset that receives committed exemplars.
const DATASET_NAME: &str = "vigil-feedback-exemplars";

struct FeedbackState {
    pending: Vec<DatasetExample>,
    dataset_id: Option<String>,
    last_flush: Instant,
}

/// Collects exemplars and commits them in bounded batches.
pub struct FeedbackCollector {
    backend: Arc<dyn TraceBackend>,
    patterns: Arc<PatternIndex>,
    state: Mutex<FeedbackState>,
}

impl FeedbackCollector {
    pub fn new(backend: Arc<dyn TraceBackend>, patterns: Arc<PatternIndex>) -> Self {
        Self {
            backend,
            patterns,
            state: Mutex::new(FeedbackState {
                pending: Vec::new(),
                dataset_id: None,
                last_flush: Instant::now(),
            }),
        }
    }

    /// Offer one scored interaction as a training exemplar.
    ///
    /// Interactions nearly identical to an already-indexed high-quality
    /// pattern are dropped; the dataset gains nothing from a clone.
    /// Returns whether the exemplar was accepted.
    pub fn offer(&self, record: &QualityRecord, input: &str, output: &str) -> bool {
        let embedding = self.patterns.embedder().embed(input);
        let near_duplicates =
            self.patterns
                .query_embedding(record.spectrum, &embedding, 1, DEDUP_SIMILARITY);
        if !near_duplicates.is_empty() {
            tracing::debug!(trace = %record.trace_id, "exemplar deduplicated against pattern index");
            return false;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pending.push(DatasetExample {
            input: input.to_string(),
            output: output.to_string(),
            score: record.score,
            spectrum: Some(record.spectrum),
            source_run_id: Some(record.trace_id.to_string()),
        });
        true
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    /// Flush when the batch or interval threshold is crossed. Returns the
    /// number of committed examples. On backend failure the batch is
    /// requeued for the next flush.
    pub async fn flush_if_due(&self) -> Result<usize, CapabilityError> {
        let batch = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let due = state.pending.len() >= FLUSH_BATCH
                || (!state.pending.is_empty() && state.last_flush.elapsed() >= FLUSH_INTERVAL);
            if !due {
                return Ok(0);
            }
            std::mem::take(&mut state.pending)
        };

        match self.commit(&batch).await {
            Ok(count) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.last_flush = Instant::now();
                Ok(count)
            }
            Err(err) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                // Requeue in front so ordering is preserved.
                let mut restored = batch;
                restored.append(&mut state.pending);
                state.pending = restored;
                Err(err)
            }
        }
    }

    async fn commit(&self, batch: &[DatasetExample]) -> Result<usize, CapabilityError> {
        let dataset_id = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.dataset_id.clone()
        };
        let dataset_id = match dataset_id {
            Some(id) => id,
            None => {
                let id = self
                    .backend
                    .create_dataset(DATASET_NAME, Some("Gateway feedback exemplars"))
                    .await?;
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.dataset_id = Some(id.clone());
                id
            }
        };
        let added = self.backend.add_examples(&dataset_id, batch).await?;
        tracing::info!(added, dataset = %dataset_id, "committed feedback exemplars");
        Ok(added)
    }
}
