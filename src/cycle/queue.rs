//! Bounded inbound trace queue: drop-oldest, never blocks the producer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::trace::TraceRecord;

/// Queue capacity. Overflow drops the oldest envelope and counts it.
pub const QUEUE_CAP: usize = 10_000;

/// A trace plus the request/response text the capabilities need.
///
/// The trace itself is the durable quality record; the text rides along
/// in process memory only, for pattern admission, feedback exemplars,
/// and annotation items.
#[derive(Debug, Clone)]
pub struct TraceEnvelope {
    pub trace: TraceRecord,
    pub input: String,
    pub output: String,
}

/// Single-producer-friendly bounded queue between the gateway and the
/// ingest loop. Pushes are non-blocking by contract: the gateway's
/// request path must never stall on the quality pipeline.
pub struct TraceQueue {
    inner: Mutex<VecDeque<TraceEnvelope>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for TraceQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAP)
    }
}

impl TraceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an envelope, dropping the oldest one on overflow.
    pub fn push(&self, envelope: TraceEnvelope) {
        {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(envelope);
        }
        self.notify.notify_one();
    }

    /// Await the next envelope. Cancel-safe: selecting against shutdown
    /// and dropping this future loses no queued envelope.
    pub async fn pop(&self) -> TraceEnvelope {
        loop {
            {
                let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(envelope) = queue.pop_front() {
                    return envelope;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop for drain-on-shutdown.
    pub fn try_pop(&self) -> Option<TraceEnvelope> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Spectrum;

    fn envelope(n: u32) -> TraceEnvelope {
        TraceEnvelope {
            trace: TraceRecord::new("s", "m", Spectrum::Identity, 100, n, n),
            input: format!("input {n}"),
            output: format!("output {n}"),
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let queue = TraceQueue::new(3);
        for n in 0..5 {
            queue.push(envelope(n));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        // Oldest two (0, 1) were dropped.
        assert_eq!(queue.try_pop().unwrap().trace.input_tokens, 2);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(TraceQueue::new(10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        // Give the consumer a chance to park first.
        tokio::task::yield_now().await;
        queue.push(envelope(7));
        let received = consumer.await.unwrap();
        assert_eq!(received.trace.input_tokens, 7);
    }

    #[test]
    fn try_pop_on_empty_is_none() {
        let queue = TraceQueue::new(3);
        assert!(queue.try_pop().is_none());
        assert!(queue.is_empty());
    }
}
