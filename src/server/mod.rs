//! Axum HTTP surface: the OpenAI-compatible chat API plus operational
//! endpoints.

mod chat;
mod ops;
mod stream;
mod types;

pub use types::{ChatCompletionRequest, ErrorResponse};

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::TieredCache;
use crate::cycle::VirtuousCycleManager;
use crate::gateway::{Dispatcher, ProviderRegistry};
use crate::monitor::{OperationMonitor, RateLimits};
use crate::util::stable_hash64;

/// Shared state for all handlers.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub manager: Arc<VirtuousCycleManager>,
    pub limits: Arc<RateLimits>,
    pub monitor: Arc<OperationMonitor>,
    pub cache: Arc<TieredCache>,
    pub registry: Arc<ProviderRegistry>,
    /// Stable per-boot configuration fingerprint reported in responses.
    pub system_fingerprint: String,
    pub started_at: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        manager: Arc<VirtuousCycleManager>,
        limits: Arc<RateLimits>,
        monitor: Arc<OperationMonitor>,
        cache: Arc<TieredCache>,
        registry: Arc<ProviderRegistry>,
    ) -> Arc<Self> {
        let model_ids: Vec<String> = registry.models().into_iter().map(|m| m.id).collect();
        let system_fingerprint = format!("fp_{:012x}", stable_hash64(&model_ids.join(",")));
        Arc::new(Self {
            dispatcher,
            manager,
            limits,
            monitor,
            cache,
            registry,
            system_fingerprint,
            started_at: Instant::now(),
        })
    }
}

/// Build the full route table.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(ops::list_models))
        .route("/health", get(ops::health))
        .route("/health/detailed", get(ops::health_detailed))
        .route("/metrics", get(ops::metrics))
        .route("/v1/virtuous-cycle/status", get(ops::cycle_status))
        .route("/v1/virtuous-cycle/trigger", post(ops::cycle_trigger))
        .route("/v1/virtuous-cycle/rollback", post(ops::cycle_rollback))
        .route("/v1/virtuous-cycle/changes", get(ops::cycle_changes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    router: Router,
    bind: std::net::SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
