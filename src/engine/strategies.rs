//! Meta-learning over optimization strategies.
//!
//! Every concluded optimization cycle reports its observed quality delta
//! back to the strategy that produced the candidate. Selection favors the
//! strategy with the best pessimistic estimate of its true effect.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Window of remembered deltas per strategy.
const DELTA_WINDOW: usize = 32;

/// One-sided 80% z-score used for the lower-bound estimate.
const LOWER_BOUND_Z: f64 = 1.28;

/// The mutation a strategy applies to a prompt variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Ground the system prompt with retrieved high-quality exemplars.
    ExemplarGrounding,
    /// Lower temperature/top_p for more deterministic output.
    TightenSampling,
    /// Append a clarifying instruction block to the system prompt.
    ClarifyInstruction,
    /// Raise max_tokens for answers cut off mid-structure.
    ExpandBudget,
}

/// A meta-learning entry tracking one strategy's observed effect.
#[derive(Debug, Clone)]
pub struct OptimizationStrategy {
    pub strategy_id: Uuid,
    pub kind: StrategyKind,
    pub description: String,
    deltas: VecDeque<f64>,
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl OptimizationStrategy {
    fn new(kind: StrategyKind, description: &str) -> Self {
        Self {
            strategy_id: Uuid::new_v4(),
            kind,
            description: description.to_string(),
            deltas: VecDeque::with_capacity(DELTA_WINDOW),
            last_applied_at: None,
        }
    }

    pub fn mean_delta(&self) -> f64 {
        if self.deltas.is_empty() {
            0.0
        } else {
            self.deltas.iter().sum::<f64>() / self.deltas.len() as f64
        }
    }

    /// Fraction of observed deltas that were positive.
    pub fn confidence(&self) -> f64 {
        if self.deltas.is_empty() {
            0.0
        } else {
            self.deltas.iter().filter(|d| **d > 0.0).count() as f64 / self.deltas.len() as f64
        }
    }

    /// Pessimistic estimate: `mean − z·stddev/√n`. Unsampled strategies
    /// score zero, which keeps them eligible for exploration against
    /// strategies with a proven negative record.
    pub fn lower_bound(&self) -> f64 {
        let n = self.deltas.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.mean_delta();
        if n == 1 {
            return mean;
        }
        let var = self
            .deltas
            .iter()
            .map(|d| (d - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        mean - LOWER_BOUND_Z * var.sqrt() / (n as f64).sqrt()
    }

    pub fn sample_count(&self) -> usize {
        self.deltas.len()
    }
}

/// Read-only view for selection results and the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySnapshot {
    pub strategy_id: Uuid,
    pub kind: StrategyKind,
    pub description: String,
    pub mean_delta: f64,
    pub confidence: f64,
    pub samples: usize,
    pub last_applied_at: Option<DateTime<Utc>>,
}

/// The strategy table. Mutated only through this type.
pub struct StrategyBook {
    inner: Mutex<Vec<OptimizationStrategy>>,
}

impl Default for StrategyBook {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyBook {
    /// Seed the built-in strategy set.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(vec![
                OptimizationStrategy::new(
                    StrategyKind::ExemplarGrounding,
                    "Ground the prompt with retrieved high-quality exemplars",
                ),
                OptimizationStrategy::new(
                    StrategyKind::TightenSampling,
                    "Reduce sampling temperature and top_p",
                ),
                OptimizationStrategy::new(
                    StrategyKind::ClarifyInstruction,
                    "Append a clarifying instruction block",
                ),
                OptimizationStrategy::new(
                    StrategyKind::ExpandBudget,
                    "Raise max_tokens for truncation-prone spectrums",
                ),
            ]),
        }
    }

    /// Pick the strategy with the highest lower-bound estimate. Ties go
    /// to the most recently applied strategy.
    pub fn select(&self) -> Option<StrategySnapshot> {
        let book = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        book.iter()
            .max_by(|a, b| {
                a.lower_bound()
                    .total_cmp(&b.lower_bound())
                    .then(a.last_applied_at.cmp(&b.last_applied_at))
            })
            .map(snapshot)
    }

    /// Mark a strategy as applied now.
    pub fn mark_applied(&self, strategy_id: Uuid) {
        let mut book = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(strategy) = book.iter_mut().find(|s| s.strategy_id == strategy_id) {
            strategy.last_applied_at = Some(Utc::now());
        }
    }

    /// Record an observed quality delta for a strategy, aging out the
    /// oldest observation past the window.
    pub fn record_delta(&self, strategy_id: Uuid, delta: f64) {
        let mut book = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(strategy) = book.iter_mut().find(|s| s.strategy_id == strategy_id) {
            if strategy.deltas.len() >= DELTA_WINDOW {
                strategy.deltas.pop_front();
            }
            strategy.deltas.push_back(delta);
        }
    }

    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        let book = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        book.iter().map(snapshot).collect()
    }
}

fn snapshot(strategy: &OptimizationStrategy) -> StrategySnapshot {
    StrategySnapshot {
        strategy_id: strategy.strategy_id,
        kind: strategy.kind,
        description: strategy.description.clone(),
        mean_delta: strategy.mean_delta(),
        confidence: strategy.confidence(),
        samples: strategy.sample_count(),
        last_applied_at: strategy.last_applied_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_positive_fraction() {
        let book = StrategyBook::new();
        let id = book.snapshots()[0].strategy_id;
        book.record_delta(id, 0.03);
        book.record_delta(id, -0.01);
        book.record_delta(id, 0.02);
        book.record_delta(id, 0.04);

        let snap = book
            .snapshots()
            .into_iter()
            .find(|s| s.strategy_id == id)
            .unwrap();
        assert!((snap.confidence - 0.75).abs() < 1e-12);
        assert!((snap.mean_delta - 0.02).abs() < 1e-12);
    }

    #[test]
    fn confidence_nondecreasing_under_identical_deltas() {
        let mut strategy = OptimizationStrategy::new(StrategyKind::TightenSampling, "t");
        let mut last = 0.0;
        for _ in 0..10 {
            strategy.deltas.push_back(0.02);
            let confidence = strategy.confidence();
            assert!(confidence >= last);
            last = confidence;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn delta_window_is_bounded() {
        let book = StrategyBook::new();
        let id = book.snapshots()[0].strategy_id;
        for i in 0..40 {
            book.record_delta(id, f64::from(i) / 100.0);
        }
        let snap = book
            .snapshots()
            .into_iter()
            .find(|s| s.strategy_id == id)
            .unwrap();
        assert_eq!(snap.samples, DELTA_WINDOW);
        // Only the newest 32 deltas remain: 8..=39.
        let expected = (8..40).map(|i| f64::from(i) / 100.0).sum::<f64>() / 32.0;
        assert!((snap.mean_delta - expected).abs() < 1e-12);
    }

    #[test]
    fn selection_prefers_proven_strategy() {
        let book = StrategyBook::new();
        let snaps = book.snapshots();
        let winner = snaps[1].strategy_id;
        let loser = snaps[2].strategy_id;
        for _ in 0..10 {
            book.record_delta(winner, 0.05);
            book.record_delta(loser, -0.05);
        }
        assert_eq!(book.select().unwrap().strategy_id, winner);
    }

    #[test]
    fn selection_penalizes_high_variance() {
        let mut steady = OptimizationStrategy::new(StrategyKind::TightenSampling, "steady");
        let mut wild = OptimizationStrategy::new(StrategyKind::ExpandBudget, "wild");
        for _ in 0..8 {
            steady.deltas.push_back(0.02);
        }
        for i in 0..8 {
            wild.deltas
                .push_back(if i % 2 == 0 { 0.20 } else { -0.15 });
        }
        // Means: steady 0.02, wild 0.025, but wild's lower bound collapses.
        assert!(steady.lower_bound() > wild.lower_bound());
    }

    #[test]
    fn unsampled_strategies_beat_proven_losers() {
        let book = StrategyBook::new();
        let loser = book.snapshots()[0].strategy_id;
        for _ in 0..10 {
            book.record_delta(loser, -0.05);
        }
        assert_ne!(book.select().unwrap().strategy_id, loser);
    }

    #[test]
    fn ties_break_by_freshness() {
        let book = StrategyBook::new();
        // All strategies tied at zero; mark one as recently applied.
        let fresh = book.snapshots()[2].strategy_id;
        book.mark_applied(fresh);
        assert_eq!(book.select().unwrap().strategy_id, fresh);
    }
}
