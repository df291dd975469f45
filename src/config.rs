//! Configuration for Vigil.
//!
//! Everything is environment-driven. `Config::from_env()` loads a `.env`
//! file when present, then builds each section with its own `from_env()`.
//! Missing required values fail boot with a hint; optional values fall
//! back to the documented defaults.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Main configuration for the gateway process.
#[derive(Debug, Clone)]
pub struct Config {
    pub observability: ObservabilityConfig,
    pub providers: ProvidersConfig,
    pub cache: CacheConfig,
    pub rate_limits: RateLimitConfig,
    pub quality: QualityConfig,
    pub optimization: OptimizationConfig,
    pub forecast: ForecastConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            observability: ObservabilityConfig::from_env()?,
            providers: ProvidersConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            rate_limits: RateLimitConfig::from_env()?,
            quality: QualityConfig::from_env()?,
            optimization: OptimizationConfig::from_env()?,
            forecast: ForecastConfig::from_env()?,
            server: ServerConfig::from_env()?,
        })
    }
}

/// Read an optional environment variable, treating empty strings as unset.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read an environment variable, parse it, or fall back to a default.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

/// Observability backend connection settings.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// API key sent in the `X-Api-Key` header. Required.
    pub api_key: SecretString,
    /// Organization identifier sent in the `X-Organization-Id` header. Required.
    pub org_id: String,
    /// Base URL for the backend API.
    pub base_url: String,
    /// Per-call timeout for short operations.
    pub short_timeout: Duration,
    /// Per-call timeout for bulk operations (exports, dataset writes).
    pub bulk_timeout: Duration,
    /// Local request budget per minute. Callers over budget are suspended,
    /// not failed.
    pub request_budget_per_min: u32,
    /// Maximum retries for transient errors.
    pub max_retries: u32,
}

impl ObservabilityConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let api_key = optional_env("OBS_API_KEY").ok_or_else(|| ConfigError::MissingRequired {
            key: "OBS_API_KEY".to_string(),
            hint: "Set OBS_API_KEY to the observability backend API key".to_string(),
        })?;
        let org_id = optional_env("OBS_ORG_ID").ok_or_else(|| ConfigError::MissingRequired {
            key: "OBS_ORG_ID".to_string(),
            hint: "Set OBS_ORG_ID to the organization identifier".to_string(),
        })?;
        let base_url = optional_env("OBS_BASE_URL")
            .unwrap_or_else(|| "https://api.observability.example.com".to_string());

        Ok(Self {
            api_key: SecretString::from(api_key),
            org_id,
            base_url,
            short_timeout: Duration::from_secs(15),
            bulk_timeout: Duration::from_secs(60),
            request_budget_per_min: 1_000,
            max_retries: 3,
        })
    }
}

/// One upstream LLM provider, enabled by `PROVIDER_{NAME}_API_KEY`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Lowercased provider name taken from the env var.
    pub name: String,
    pub api_key: SecretString,
    /// Chat-completions base URL. Providers without one are served by the
    /// built-in canned backend (offline/dev operation).
    pub base_url: Option<String>,
    /// Model ids this provider serves, in priority order. Empty means the
    /// provider acts as a catch-all for unlisted models.
    pub models: Vec<String>,
}

/// All configured providers, in env-discovery order.
#[derive(Debug, Clone, Default)]
pub struct ProvidersConfig {
    pub providers: Vec<ProviderConfig>,
}

impl ProvidersConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut providers = Vec::new();
        let mut discovered: Vec<(String, String)> = std::env::vars()
            .filter_map(|(key, value)| {
                let name = key
                    .strip_prefix("PROVIDER_")?
                    .strip_suffix("_API_KEY")?
                    .to_string();
                (!value.is_empty()).then_some((name, value))
            })
            .collect();
        // Deterministic registration order regardless of env iteration order.
        discovered.sort();

        for (name, api_key) in discovered {
            let base_url = optional_env(&format!("PROVIDER_{name}_BASE_URL"));
            let models = optional_env(&format!("PROVIDER_{name}_MODELS"))
                .map(|raw| {
                    raw.split(',')
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            providers.push(ProviderConfig {
                name: name.to_ascii_lowercase(),
                api_key: SecretString::from(api_key),
                base_url,
                models,
            });
        }

        Ok(Self { providers })
    }
}

/// Cache layer settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Remote key-value tier. Absent degrades to L1-only.
    pub redis_url: Option<String>,
    /// L1 entry capacity.
    pub l1_capacity: usize,
    /// L1 entry TTL.
    pub l1_ttl: Duration,
}

impl CacheConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: optional_env("REDIS_URL"),
            l1_capacity: env_parse("CACHE_L1_CAPACITY", 1_000)?,
            l1_ttl: Duration::from_secs(15 * 60),
        })
    }
}

/// Per-route rate limits, requests per minute per caller.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub chat_per_min: u32,
    pub models_per_min: u32,
    pub health_per_min: u32,
    pub metrics_per_min: u32,
}

impl RateLimitConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            chat_per_min: env_parse("RATE_LIMIT_CHAT_PER_MIN", 100)?,
            models_per_min: env_parse("RATE_LIMIT_MODELS_PER_MIN", 500)?,
            health_per_min: env_parse("RATE_LIMIT_HEALTH_PER_MIN", 1_000)?,
            metrics_per_min: env_parse("RATE_LIMIT_METRICS_PER_MIN", 100)?,
        })
    }
}

/// Weights for the fallback quality score.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub success: f64,
    pub latency: f64,
    pub structure: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success: 0.5,
            latency: 0.2,
            structure: 0.3,
        }
    }
}

/// Quality collection and regression-detection settings.
#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Absolute live-mean floor; sustained breach triggers optimization.
    pub threshold_target: f64,
    /// Minimum baseline-minus-live delta treated as a regression.
    pub regression_delta: f64,
    /// Fallback score weights.
    pub weights: ScoreWeights,
    /// Latency SLO for the fallback score.
    pub slo_ms: u64,
    /// Live window length.
    pub live_window: Duration,
    /// Baseline window length.
    pub baseline_window: Duration,
    /// Monitoring cadence.
    pub cadence: Duration,
    /// Flat per-token rate used for per-trace cost estimates.
    pub cost_per_token: rust_decimal::Decimal,
}

impl QualityConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let threshold_target: f64 = env_parse("QUALITY_THRESHOLD_TARGET", 0.90)?;
        if !(0.0..=1.0).contains(&threshold_target) {
            return Err(ConfigError::InvalidValue {
                key: "QUALITY_THRESHOLD_TARGET".to_string(),
                message: "must be within [0, 1]".to_string(),
            });
        }
        Ok(Self {
            threshold_target,
            regression_delta: env_parse("REGRESSION_DELTA", 0.05)?,
            weights: ScoreWeights::default(),
            slo_ms: env_parse("QUALITY_SLO_MS", 3_000)?,
            live_window: Duration::from_secs(3_600),
            baseline_window: Duration::from_secs(7 * 24 * 3_600),
            cadence: Duration::from_secs(30),
            cost_per_token: rust_decimal_macros::dec!(0.000002),
        })
    }
}

/// Optimization-cycle settings.
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub max_concurrent: usize,
    pub cooldown: Duration,
    pub ab_min_samples: usize,
    pub ab_max_duration: Duration,
    pub ab_alpha: f64,
    /// Treatment must beat control by at least this much to deploy.
    pub min_success_delta: f64,
    /// Consecutive sub-threshold windows before the absolute trigger fires.
    pub sustained_windows: u32,
}

impl OptimizationConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let max_duration_days: u64 = env_parse("AB_MAX_DURATION_DAYS", 7)?;
        Ok(Self {
            max_concurrent: env_parse("OPTIMIZATION_MAX_CONCURRENT", 3)?,
            cooldown: Duration::from_secs(60 * env_parse("OPTIMIZATION_COOLDOWN_MIN", 60u64)?),
            ab_min_samples: env_parse("AB_MIN_SAMPLES", 30)?,
            ab_max_duration: Duration::from_secs(max_duration_days * 24 * 3_600),
            ab_alpha: env_parse("AB_ALPHA", 0.05)?,
            min_success_delta: 0.02,
            sustained_windows: 3,
        })
    }
}

/// Quality-forecasting settings.
#[derive(Debug, Clone)]
pub struct ForecastConfig {
    pub horizon_hours: u32,
    pub min_samples: usize,
}

impl ForecastConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            horizon_hours: env_parse("FORECAST_HORIZON_HOURS", 168)?,
            min_samples: env_parse("FORECAST_MIN_SAMPLES", 200)?,
        })
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let raw = optional_env("GATEWAY_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string());
        let bind = raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: "GATEWAY_BIND".to_string(),
            message: format!("must be host:port: {e}"),
        })?;
        Ok(Self { bind })
    }
}
