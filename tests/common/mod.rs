//! Shared wiring for wire-level integration tests: a full gateway stack
//! over the canned provider and the in-memory trace backend.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use vigil::cache::{LocalCache, TieredCache};
use vigil::config::{
    ForecastConfig, OptimizationConfig, QualityConfig, RateLimitConfig, ScoreWeights,
};
use vigil::cycle::{AlertLedger, TraceQueue, VirtuousCycleManager};
use vigil::engine::CapabilityEngine;
use vigil::gateway::{CannedProvider, Dispatcher, ProviderRegistry, VariantStore};
use vigil::monitor::{OperationMonitor, RateLimits};
use vigil::observability::memory::InMemoryBackend;
use vigil::quality::QualityCollector;
use vigil::server::{AppState, build_router};

pub struct TestStack {
    pub router: Router,
    pub manager: Arc<VirtuousCycleManager>,
    pub monitor: Arc<OperationMonitor>,
    pub backend: Arc<InMemoryBackend>,
}

pub fn quality_config() -> QualityConfig {
    QualityConfig {
        threshold_target: 0.90,
        regression_delta: 0.05,
        weights: ScoreWeights::default(),
        slo_ms: 3_000,
        live_window: Duration::from_secs(3_600),
        baseline_window: Duration::from_secs(7 * 24 * 3_600),
        cadence: Duration::from_secs(0),
        cost_per_token: rust_decimal_macros::dec!(0.000002),
    }
}

pub fn optimization_config() -> OptimizationConfig {
    OptimizationConfig {
        max_concurrent: 3,
        cooldown: Duration::from_secs(3_600),
        ab_min_samples: 30,
        ab_max_duration: Duration::from_secs(7 * 24 * 3_600),
        ab_alpha: 0.05,
        min_success_delta: 0.02,
        sustained_windows: 3,
    }
}

pub fn stack(chat_per_min: u32) -> TestStack {
    let backend = Arc::new(InMemoryBackend::new());
    let quality = quality_config();
    let optimization = optimization_config();
    let forecast = ForecastConfig {
        horizon_hours: 24,
        min_samples: 200,
    };

    let collector = Arc::new(QualityCollector::new(quality.clone()));
    let engine = Arc::new(CapabilityEngine::new(
        backend.clone() as Arc<dyn vigil::observability::TraceBackend>,
        &quality,
        &optimization,
        &forecast,
    ));
    let variants = Arc::new(VariantStore::new());
    let queue = Arc::new(TraceQueue::default());
    let monitor = Arc::new(OperationMonitor::new());
    let cache = Arc::new(TieredCache::new(
        LocalCache::new(256, Duration::from_secs(900)),
        None,
    ));

    let manager = VirtuousCycleManager::new(
        collector,
        engine.clone(),
        variants.clone(),
        Arc::new(AlertLedger::default()),
        monitor.clone(),
        queue.clone(),
        optimization,
        quality,
    );

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(CannedProvider::new("local")), Vec::new());
    let registry = Arc::new(registry);

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        variants,
        engine,
        cache.clone(),
        queue,
        monitor.clone(),
    ));

    let limits = Arc::new(RateLimits::new(&RateLimitConfig {
        chat_per_min,
        models_per_min: 500,
        health_per_min: 1_000,
        metrics_per_min: 100,
    }));

    let state = AppState::new(
        dispatcher,
        manager.clone(),
        limits,
        monitor.clone(),
        cache,
        registry,
    );

    TestStack {
        router: build_router(state),
        manager,
        monitor,
        backend,
    }
}
