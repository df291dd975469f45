//! Vigil gateway binary: configuration, wiring, and serving.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigil::cache::{LocalCache, RemoteCache, TieredCache};
use vigil::config::Config;
use vigil::cycle::{AlertLedger, TraceQueue, VirtuousCycleManager};
use vigil::engine::CapabilityEngine;
use vigil::error::ConfigError;
use vigil::gateway::{Dispatcher, ProviderRegistry, VariantStore};
use vigil::monitor::{OperationMonitor, RateLimits};
use vigil::observability::{ObservabilityClient, TraceBackend};
use vigil::quality::QualityCollector;
use vigil::server::{AppState, build_router, serve};

#[derive(Parser)]
#[command(name = "vigil", version, about = "Self-optimizing LLM gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Validate configuration and backend credentials, then exit.
    CheckConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::from_env()?;

    // Preflight the observability credentials before binding anything:
    // an unauthenticated core must never start serving.
    let backend = Arc::new(ObservabilityClient::new(config.observability.clone())?);
    if let Err(err) = backend.workspace_stats().await {
        if matches!(err, vigil::error::ObservabilityError::Auth { .. }) {
            return Err(ConfigError::PreflightFailed {
                reason: format!("observability backend rejected credentials: {err}"),
            }
            .into());
        }
        // A transient outage at boot is survivable; the loops retry.
        tracing::warn!(error = %err, "observability preflight degraded, continuing");
    }

    if matches!(cli.command, Some(Command::CheckConfig)) {
        println!("configuration ok");
        return Ok(());
    }

    // Leaves first: cache and monitor, then collector, engine, cycle,
    // gateway.
    let remote = match &config.cache.redis_url {
        Some(url) => match RemoteCache::connect(url).await {
            Ok(remote) => Some(remote),
            Err(err) => {
                tracing::warn!(error = %err, "L2 cache unavailable, degrading to L1-only");
                None
            }
        },
        None => None,
    };
    let cache = Arc::new(TieredCache::new(
        LocalCache::new(config.cache.l1_capacity, config.cache.l1_ttl),
        remote,
    ));
    let monitor = Arc::new(OperationMonitor::new());
    let limits = Arc::new(RateLimits::new(&config.rate_limits));

    let collector = Arc::new(QualityCollector::new(config.quality.clone()));
    let engine = Arc::new(CapabilityEngine::new(
        backend.clone() as Arc<dyn TraceBackend>,
        &config.quality,
        &config.optimization,
        &config.forecast,
    ));
    let variants = Arc::new(VariantStore::new());
    let alerts = Arc::new(AlertLedger::default());
    let queue = Arc::new(TraceQueue::default());

    let manager = VirtuousCycleManager::new(
        collector,
        engine.clone(),
        variants.clone(),
        alerts,
        monitor.clone(),
        queue.clone(),
        config.optimization.clone(),
        config.quality.clone(),
    );

    let registry = Arc::new(ProviderRegistry::from_config(&config.providers)?);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        variants,
        engine,
        cache.clone(),
        queue,
        monitor.clone(),
    ));

    manager.start();

    let state = AppState::new(
        dispatcher,
        manager.clone(),
        limits,
        monitor,
        cache,
        registry,
    );
    let router = build_router(state);

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    };
    serve(router, config.server.bind, shutdown).await?;

    manager.shutdown().await;
    Ok(())
}
