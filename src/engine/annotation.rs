//! Annotation queue integration: route borderline interactions to
//! human review.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::CapabilityError;
use crate::observability::{AnnotationItem, TraceBackend};
use crate::quality::{QualityRecord, structurally_valid};
use crate::trace::{Spectrum, TraceRecord};
use crate::util::stable_hash64;

/// Scores in this band are ambiguous enough to be worth a human look.
const REVIEW_BAND: std::ops::RangeInclusive<f64> = 0.70..=0.88;

/// Maximum pending items per queue.
const PENDING_CAP: usize = 500;

/// Bounded dedup ledger size.
const DEDUP_CAP: usize = 4_096;

struct RouterState {
    pending: usize,
    seen: HashSet<(String, Spectrum, u64)>,
    seen_order: VecDeque<(String, Spectrum, u64)>,
}

/// Routes annotation candidates to the backend queue, newest first,
/// deduplicated by (model, spectrum, input hash).
pub struct AnnotationRouter {
    backend: Arc<dyn TraceBackend>,
    queue_id: String,
    state: Mutex<RouterState>,
}

impl AnnotationRouter {
    pub fn new(backend: Arc<dyn TraceBackend>, queue_id: impl Into<String>) -> Self {
        Self {
            backend,
            queue_id: queue_id.into(),
            state: Mutex::new(RouterState {
                pending: 0,
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
            }),
        }
    }

    /// Whether a record qualifies for human annotation.
    pub fn qualifies(trace: &TraceRecord, record: &QualityRecord) -> bool {
        REVIEW_BAND.contains(&record.score) || !structurally_valid(trace)
    }

    /// Consider one interaction. Returns whether it was enqueued.
    pub async fn consider(
        &self,
        trace: &TraceRecord,
        record: &QualityRecord,
        input: &str,
    ) -> Result<bool, CapabilityError> {
        if !Self::qualifies(trace, record) {
            return Ok(false);
        }

        let key = (record.model.clone(), record.spectrum, stable_hash64(input));
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.pending >= PENDING_CAP {
                tracing::debug!(queue = %self.queue_id, "annotation queue at capacity, skipping");
                return Ok(false);
            }
            if !state.seen.insert(key.clone()) {
                return Ok(false);
            }
            if state.seen_order.len() >= DEDUP_CAP
                && let Some(oldest) = state.seen_order.pop_front()
            {
                state.seen.remove(&oldest);
            }
            state.seen_order.push_back(key);
            state.pending += 1;
        }

        let reason = if REVIEW_BAND.contains(&record.score) {
            format!("score {:.2} in review band", record.score)
        } else {
            "failed structural validation".to_string()
        };
        let item = AnnotationItem {
            run_id: record.trace_id.to_string(),
            model: record.model.clone(),
            spectrum: record.spectrum,
            input: input.to_string(),
            score: record.score,
            reason,
        };

        match self.backend.enqueue_annotation(&self.queue_id, item).await {
            Ok(()) => Ok(true),
            Err(err) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.pending = state.pending.saturating_sub(1);
                Err(CapabilityError::Backend(err))
            }
        }
    }

    /// Refresh the local pending count from the backend. Called by the
    /// housekeeping loop so completed annotations free capacity.
    pub async fn sync_pending(&self) -> Result<(), CapabilityError> {
        let queues = self.backend.list_annotation_queues().await?;
        if let Some(info) = queues.into_iter().find(|q| q.id == self.queue_id) {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending = info.pending;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pending
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;
    use crate::observability::memory::InMemoryBackend;
    use crate::quality::bucket_align;

    fn trace() -> TraceRecord {
        TraceRecord::new("s", "m", Spectrum::Identity, 100, 10, 20)
    }

    fn record(score: f64) -> QualityRecord {
        let now = Utc::now();
        QualityRecord {
            trace_id: Uuid::new_v4(),
            model: "m".into(),
            spectrum: Spectrum::Identity,
            score,
            latency_ms: 100,
            cost_estimate: Decimal::ZERO,
            window_bucket: bucket_align(now),
            timestamp: now,
        }
    }

    #[test]
    fn review_band_and_structure_qualify() {
        assert!(AnnotationRouter::qualifies(&trace(), &record(0.70)));
        assert!(AnnotationRouter::qualifies(&trace(), &record(0.88)));
        assert!(!AnnotationRouter::qualifies(&trace(), &record(0.95)));
        assert!(!AnnotationRouter::qualifies(&trace(), &record(0.5)));

        let broken = trace().with_error("boom");
        assert!(AnnotationRouter::qualifies(&broken, &record(0.95)));
    }

    #[tokio::test]
    async fn enqueues_band_scores() {
        let backend = Arc::new(InMemoryBackend::new());
        let router = AnnotationRouter::new(backend.clone(), "review");
        let enqueued = router
            .consider(&trace(), &record(0.8), "ambiguous question")
            .await
            .unwrap();
        assert!(enqueued);
        assert_eq!(backend.queued_items("review").len(), 1);
        assert_eq!(router.pending(), 1);
    }

    #[tokio::test]
    async fn duplicate_inputs_are_dropped() {
        let backend = Arc::new(InMemoryBackend::new());
        let router = AnnotationRouter::new(backend.clone(), "review");
        router
            .consider(&trace(), &record(0.8), "same question")
            .await
            .unwrap();
        let second = router
            .consider(&trace(), &record(0.82), "same question")
            .await
            .unwrap();
        assert!(!second);
        assert_eq!(backend.queued_items("review").len(), 1);
    }

    #[tokio::test]
    async fn capacity_blocks_new_items() {
        let backend = Arc::new(InMemoryBackend::new());
        let router = AnnotationRouter::new(backend.clone(), "review");
        {
            let mut state = router.state.lock().unwrap();
            state.pending = PENDING_CAP;
        }
        let enqueued = router
            .consider(&trace(), &record(0.8), "one more")
            .await
            .unwrap();
        assert!(!enqueued);
        assert!(backend.queued_items("review").is_empty());
    }

    #[tokio::test]
    async fn sync_pending_reads_backend() {
        let backend = Arc::new(InMemoryBackend::new());
        let router = AnnotationRouter::new(backend.clone(), "review");
        router
            .consider(&trace(), &record(0.8), "question")
            .await
            .unwrap();
        // Pretend the queue drained on the backend side.
        router.sync_pending().await.unwrap();
        assert_eq!(router.pending(), backend.queued_items("review").len());
    }
}
