//! End-to-end behavior of the virtuous cycle over synthetic traffic.

mod common;

use std::time::Duration;

use chrono::Utc;
use vigil::cycle::TraceEnvelope;
use vigil::trace::{Spectrum, TraceRecord};

/// Synthetic trace with a controlled score and age.
fn trace_at(score: f64, minutes_ago: i64, jitter: f64) -> TraceRecord {
    let mut trace = TraceRecord::new("session-e2e", "gpt-4o-mini", Spectrum::Identity, 120, 20, 20)
        .with_feedback((score + jitter).clamp(0.0, 1.0));
    trace.created_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
    trace
}

/// Drive baseline quality to ~0.92 (older than the live window) and live
/// quality to ~0.85, then tick the monitor.
#[tokio::test]
async fn regression_triggers_one_cycle_within_a_tick() {
    let stack = common::stack(100);
    let manager = &stack.manager;

    // Baseline: two hours old, mean 0.92.
    for i in 0..300 {
        let jitter = if i % 2 == 0 { 0.02 } else { -0.02 };
        let envelope = TraceEnvelope {
            trace: trace_at(0.92, 120, jitter),
            input: format!("baseline question {i}"),
            output: "answer".to_string(),
        };
        manager.queue().push(envelope);
    }
    // Live: fresh, mean 0.85.
    for i in 0..100 {
        let jitter = if i % 2 == 0 { 0.02 } else { -0.02 };
        let envelope = TraceEnvelope {
            trace: trace_at(0.85, 0, jitter),
            input: format!("live question {i}"),
            output: "answer".to_string(),
        };
        manager.queue().push(envelope);
    }

    manager.start();

    // Wait for the ingest loop to drain the queue.
    for _ in 0..100 {
        if manager.status().metrics.traces_processed == 400 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.status().metrics.traces_processed, 400);

    // One monitoring tick must detect the regression and put exactly one
    // optimization in flight for the degraded key.
    manager.quality_tick();
    assert_eq!(manager.in_flight(), 1);

    // A second tick coalesces instead of stacking another cycle.
    manager.quality_tick();
    assert_eq!(manager.in_flight(), 1);

    // The regression alert fired once.
    let alerts = manager.alerts().recent(10);
    assert!(alerts.iter().any(|a| a.kind == "quality_regression"));

    // The optimizer loop picks the trigger up and counts the cycle.
    for _ in 0..100 {
        if manager.status().metrics.optimizations_triggered >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(manager.status().metrics.optimizations_triggered, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn duplicate_traces_do_not_double_count() {
    let stack = common::stack(100);
    let manager = &stack.manager;

    let trace = trace_at(0.9, 0, 0.0);
    for _ in 0..3 {
        manager.queue().push(TraceEnvelope {
            trace: trace.clone(),
            input: "same trace".to_string(),
            output: "answer".to_string(),
        });
    }

    manager.start();
    for _ in 0..100 {
        if stack.monitor.counter("traces_rejected_total") == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = manager.status();
    assert_eq!(status.metrics.traces_processed, 1, "duplicates rejected");
    assert_eq!(stack.monitor.counter("traces_rejected_total"), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn feedback_traces_become_annotation_candidates() {
    let stack = common::stack(100);
    let manager = &stack.manager;

    // Scores inside the review band go to the annotation queue.
    manager.queue().push(TraceEnvelope {
        trace: trace_at(0.80, 0, 0.0),
        input: "ambiguous borderline answer".to_string(),
        output: "answer".to_string(),
    });

    manager.start();
    for _ in 0..100 {
        if !stack.backend.queued_items("vigil-review").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let queued = stack.backend.queued_items("vigil-review");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].model, "gpt-4o-mini");

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_within_deadline() {
    let stack = common::stack(100);
    let manager = &stack.manager;
    manager.start();

    for i in 0..50 {
        manager.queue().push(TraceEnvelope {
            trace: trace_at(0.95, 0, 0.0),
            input: format!("q {i}"),
            output: "a".to_string(),
        });
    }

    let started = std::time::Instant::now();
    manager.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(!manager.status().monitoring_active);
}
