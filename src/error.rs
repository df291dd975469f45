//! Error types for Vigil.

use std::time::Duration;

use uuid::Uuid;

use crate::trace::Spectrum;

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Observability backend error: {0}")]
    Observability(#[from] ObservabilityError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Cycle error: {0}")]
    Cycle(#[from] CycleError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Configuration-related errors. All of these are fatal at boot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Startup preflight failed: {reason}")]
    PreflightFailed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the external trace/feedback backend.
///
/// The retry policy hangs off [`ObservabilityError::is_retryable`]: only
/// connection failures, 429s, and 5xx responses are retried. Auth failures
/// are fatal to the calling capability, and every other 4xx is returned to
/// the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("Backend authentication failed (HTTP {status})")]
    Auth { status: u16 },

    #[error("Backend rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient backend failure: {reason}")]
    Transient { reason: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Backend rejected request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ObservabilityError {
    /// Whether the request may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transient { .. } => true,
            // reqwest errors without a status are connection-level failures.
            Self::Http(e) => e.status().is_none() || e.is_timeout() || e.is_connect(),
            Self::Auth { .. }
            | Self::NotFound { .. }
            | Self::Protocol { .. }
            | Self::Rejected { .. }
            | Self::Json(_) => false,
        }
    }

    /// Server-suggested delay, when the backend sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Trace ingest rejections from the quality collector.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CollectorError {
    #[error("Duplicate trace {trace_id}")]
    DuplicateTrace { trace_id: Uuid },

    #[error("Token accounting mismatch: total {total} != {input} input + {output} output")]
    TokenMismatch { total: u32, input: u32, output: u32 },

    #[error("Feedback score {score} outside [0, 1]")]
    ScoreOutOfRange { score: String },

    #[error("Malformed trace: {reason}")]
    Malformed { reason: String },
}

/// Failure modes shared by all eight engine capabilities.
///
/// `InsufficientData` short-circuits to a no-op at the call site,
/// `Backend` is retried by the cycle scheduler, and `Invariant` is logged
/// at error level and raised.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Insufficient data: need {needed} samples, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("Transient backend failure: {0}")]
    Backend(#[from] ObservabilityError),

    #[error("Invariant violation: {detail}")]
    Invariant { detail: String },
}

impl CapabilityError {
    /// Whether the cycle scheduler should retry the capability invocation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::InsufficientData { .. } | Self::Invariant { .. } => false,
        }
    }
}

/// Virtuous-cycle orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Optimization already in flight for {model}/{spectrum}")]
    AlreadyInFlight { model: String, spectrum: Spectrum },

    #[error("Cooldown active for {model}/{spectrum}, {remaining:?} remaining")]
    CooldownActive {
        model: String,
        spectrum: Spectrum,
        remaining: Duration,
    },

    #[error("Optimization concurrency cap ({max}) reached")]
    AtCapacity { max: usize },

    #[error("Variant {variant_id} not found")]
    VariantNotFound { variant_id: Uuid },

    #[error("Experiment {experiment_id} already concluded as {status}")]
    ExperimentConcluded { experiment_id: Uuid, status: String },

    #[error("Invariant violation: {detail}")]
    Invariant { detail: String },
}

/// Chat gateway errors. `kind()` gives the stable wire-level error kind.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLength { used: usize, limit: usize },

    #[error("Upstream rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("No provider registered for model {model}")]
    UnknownModel { model: String },

    #[error("Internal gateway error: {reason}")]
    Internal { reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Stable `error.kind` value for the wire envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable { .. } | Self::Http(_) => "provider_unavailable",
            Self::ContextLength { .. } => "context_length",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } | Self::UnknownModel { .. } => "invalid_request",
            Self::Internal { .. } | Self::Json(_) => "internal",
        }
    }

    /// Whether the next provider in the failover list should be tried.
    ///
    /// User errors and context-length failures propagate immediately: a
    /// different provider will not fix them for the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. } | Self::RateLimited { .. } | Self::Http(_)
        )
    }
}

/// Cache-tier errors. These never surface to request handlers; an L2
/// failure degrades the cache to L1-only.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Remote cache unavailable: {reason}")]
    Remote { reason: String },

    #[error("Remote cache protocol error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::MissingRequired {
            key: "OBS_API_KEY".to_string(),
            hint: "Set OBS_API_KEY to the observability backend key".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("OBS_API_KEY"), "Should mention the key: {msg}");
        assert!(msg.contains("Set OBS_API_KEY"), "Should include hint: {msg}");
    }

    #[test]
    fn observability_retry_classification() {
        assert!(
            ObservabilityError::Transient {
                reason: "503".into()
            }
            .is_retryable()
        );
        assert!(
            ObservabilityError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            }
            .is_retryable()
        );
        assert!(!ObservabilityError::Auth { status: 401 }.is_retryable());
        assert!(
            !ObservabilityError::NotFound {
                resource: "run/abc".into()
            }
            .is_retryable()
        );
        assert!(
            !ObservabilityError::Rejected {
                status: 422,
                body: "bad filter".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn observability_retry_after_passthrough() {
        let err = ObservabilityError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(
            ObservabilityError::Transient { reason: "x".into() }.retry_after(),
            None
        );
    }

    #[test]
    fn gateway_error_kinds() {
        assert_eq!(
            GatewayError::ProviderUnavailable {
                provider: "openai".into(),
                reason: "502".into()
            }
            .kind(),
            "provider_unavailable"
        );
        assert_eq!(
            GatewayError::ContextLength {
                used: 9000,
                limit: 8192
            }
            .kind(),
            "context_length"
        );
        assert_eq!(
            GatewayError::RateLimited { retry_after: None }.kind(),
            "rate_limited"
        );
        assert_eq!(
            GatewayError::Internal {
                reason: "oops".into()
            }
            .kind(),
            "internal"
        );
    }

    #[test]
    fn gateway_failover_classification() {
        assert!(
            GatewayError::ProviderUnavailable {
                provider: "a".into(),
                reason: "timeout".into()
            }
            .is_retryable()
        );
        assert!(
            !GatewayError::InvalidRequest {
                reason: "empty messages".into()
            }
            .is_retryable()
        );
        assert!(
            !GatewayError::ContextLength { used: 10, limit: 5 }.is_retryable()
        );
    }

    #[test]
    fn capability_retry_classification() {
        assert!(
            CapabilityError::Backend(ObservabilityError::Transient {
                reason: "conn reset".into()
            })
            .is_retryable()
        );
        assert!(
            !CapabilityError::InsufficientData {
                needed: 200,
                have: 12
            }
            .is_retryable()
        );
        assert!(
            !CapabilityError::Invariant {
                detail: "buffer overrun".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn top_level_error_from_conversions() {
        let err: Error = ConfigError::PreflightFailed {
            reason: "auth".into(),
        }
        .into();
        assert!(matches!(err, Error::Config(_)));

        let err: Error = CollectorError::TokenMismatch {
            total: 10,
            input: 3,
            output: 4,
        }
        .into();
        assert!(matches!(err, Error::Collector(_)));

        let err: Error = CycleError::AtCapacity { max: 3 }.into();
        assert!(matches!(err, Error::Cycle(_)));
    }
}
