//! The autonomous capability engine: eight independently invokable,
//! idempotent capabilities over the quality stream.
//!
//! The engine owns all mutation of patterns, strategies, experiments,
//! and forecasts. The cycle manager invokes capabilities on schedule and
//! handles their failures per the shared semantics: insufficient data
//! no-ops, transient backend errors retry, invariant violations raise.

mod annotation;
mod experiments;
mod feedback;
mod forecast;
mod patterns;
mod regression;
mod rollups;
mod stats;
mod strategies;

pub use annotation::AnnotationRouter;
pub use experiments::{
    Arm, DecisionConfig, Experiment, ExperimentBoard, ExperimentStatus, ExperimentSummary,
};
pub use feedback::FeedbackCollector;
pub use forecast::{ForecastPoint, forecast, mape};
pub use patterns::{
    DEFAULT_K, Embedder, HashedEmbedder, Pattern, PatternIndex, PatternMatch, cosine,
};
pub use regression::{RegressionAnalysis, RegressionConfig, detect as detect_regression};
pub use rollups::{DailyRollup, RollupEngine};
pub use stats::{SampleStats, WelchResult, welch_t_test};
pub use strategies::{OptimizationStrategy, StrategyBook, StrategyKind, StrategySnapshot};

use std::sync::{Arc, Mutex};

use crate::config::{ForecastConfig, OptimizationConfig, QualityConfig};
use crate::error::CapabilityError;
use crate::observability::TraceBackend;
use crate::quality::QualityWindow;

/// Annotation queue that receives review candidates.
const REVIEW_QUEUE_ID: &str = "vigil-review";

/// Bundle of all eight capabilities with their shared dependencies.
pub struct CapabilityEngine {
    patterns: Arc<PatternIndex>,
    strategies: StrategyBook,
    board: ExperimentBoard,
    feedback: FeedbackCollector,
    rollups: RollupEngine,
    annotations: AnnotationRouter,
    regression_config: RegressionConfig,
    decision_config: DecisionConfig,
    forecast_config: ForecastConfig,
    latest_forecast: Mutex<Option<Vec<ForecastPoint>>>,
}

impl CapabilityEngine {
    pub fn new(
        backend: Arc<dyn TraceBackend>,
        quality: &QualityConfig,
        optimization: &OptimizationConfig,
        forecast: &ForecastConfig,
    ) -> Self {
        let patterns = Arc::new(PatternIndex::new(Arc::new(HashedEmbedder::default())));
        Self {
            feedback: FeedbackCollector::new(backend.clone(), patterns.clone()),
            rollups: RollupEngine::new(backend.clone(), quality.cost_per_token),
            annotations: AnnotationRouter::new(backend, REVIEW_QUEUE_ID),
            patterns,
            strategies: StrategyBook::new(),
            board: ExperimentBoard::new(),
            regression_config: RegressionConfig {
                min_delta: quality.regression_delta,
                alpha: optimization.ab_alpha,
            },
            decision_config: DecisionConfig {
                min_samples: optimization.ab_min_samples,
                alpha: optimization.ab_alpha,
                max_duration: optimization.ab_max_duration,
            },
            forecast_config: forecast.clone(),
            latest_forecast: Mutex::new(None),
        }
    }

    pub fn patterns(&self) -> &PatternIndex {
        &self.patterns
    }

    pub fn strategies(&self) -> &StrategyBook {
        &self.strategies
    }

    pub fn board(&self) -> &ExperimentBoard {
        &self.board
    }

    pub fn feedback(&self) -> &FeedbackCollector {
        &self.feedback
    }

    pub fn rollups(&self) -> &RollupEngine {
        &self.rollups
    }

    pub fn annotations(&self) -> &AnnotationRouter {
        &self.annotations
    }

    pub fn decision_config(&self) -> &DecisionConfig {
        &self.decision_config
    }

    /// Delta analysis over a live/baseline window pair.
    pub fn run_regression(
        &self,
        live: &QualityWindow,
        baseline: &QualityWindow,
    ) -> Result<Option<RegressionAnalysis>, CapabilityError> {
        detect_regression(live, baseline, &self.regression_config)
    }

    /// Recompute the quality forecast from an hourly series. The previous
    /// forecast is kept when the series is still too short.
    pub fn refresh_forecast(&self, series: &[f64]) -> Result<usize, CapabilityError> {
        let points = forecast(
            series,
            self.forecast_config.horizon_hours,
            self.forecast_config.min_samples,
        )?;
        let count = points.len();
        let mut latest = self
            .latest_forecast
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *latest = Some(points);
        Ok(count)
    }

    pub fn latest_forecast(&self) -> Option<Vec<ForecastPoint>> {
        self.latest_forecast
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreWeights;
    use crate::observability::memory::InMemoryBackend;
    use std::time::Duration;

    fn engine() -> CapabilityEngine {
        let quality = QualityConfig {
            threshold_target: 0.90,
            regression_delta: 0.05,
            weights: ScoreWeights::default(),
            slo_ms: 3_000,
            live_window: Duration::from_secs(3_600),
            baseline_window: Duration::from_secs(7 * 24 * 3_600),
            cadence: Duration::from_secs(30),
            cost_per_token: rust_decimal_macros::dec!(0.000002),
        };
        let optimization = OptimizationConfig {
            max_concurrent: 3,
            cooldown: Duration::from_secs(3_600),
            ab_min_samples: 30,
            ab_max_duration: Duration::from_secs(7 * 24 * 3_600),
            ab_alpha: 0.05,
            min_success_delta: 0.02,
            sustained_windows: 3,
        };
        let forecast = ForecastConfig {
            horizon_hours: 24,
            min_samples: 200,
        };
        CapabilityEngine::new(
            Arc::new(InMemoryBackend::new()),
            &quality,
            &optimization,
            &forecast,
        )
    }

    #[test]
    fn forecast_refresh_stores_latest() {
        let engine = engine();
        assert!(engine.latest_forecast().is_none());

        let series = vec![0.9; 240];
        let count = engine.refresh_forecast(&series).unwrap();
        assert_eq!(count, 24);
        assert_eq!(engine.latest_forecast().unwrap().len(), 24);
    }

    #[test]
    fn short_series_keeps_previous_forecast() {
        let engine = engine();
        engine.refresh_forecast(&vec![0.9; 240]).unwrap();
        let err = engine.refresh_forecast(&[0.9; 10]).unwrap_err();
        assert!(matches!(err, CapabilityError::InsufficientData { .. }));
        assert!(engine.latest_forecast().is_some());
    }
}
