//! Request dispatch: cache, variant application, experiment allocation,
//! provider failover, token accounting, and trace emission.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::{ChatMessage, ChatRequest, FinishReason, Provider};
use super::registry::ProviderRegistry;
use super::variants::{PromptVariant, VariantStore};
use crate::cache::{CacheClass, TieredCache};
use crate::cycle::{TraceEnvelope, TraceQueue};
use crate::engine::CapabilityEngine;
use crate::error::GatewayError;
use crate::monitor::OperationMonitor;
use crate::trace::{Spectrum, TraceRecord};
use crate::util::stable_hash64;

/// Primary plus at most two fallbacks per request.
const MAX_PROVIDERS_PER_REQUEST: usize = 3;

/// Token accounting of one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A finalized chat completion, the unit stored in the response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Dispatch outcome: the completion plus whether it came from cache.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub completion: ChatCompletion,
    pub cached: bool,
    /// Wall-clock serving time, which drives streaming chunk pacing.
    pub latency_ms: u64,
}

/// Classify a query into its spectrum from lexical signals.
///
/// Callers may override via the `x-vigil-spectrum` header; this is the
/// deterministic fallback.
pub fn classify_spectrum(text: &str) -> Spectrum {
    let lower = text.to_lowercase();
    let contains_any =
        |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if text.trim().is_empty() || text.len() > 8_000 {
        Spectrum::Edge
    } else if contains_any(&["who is", "identity", "name of", "ssn", "date of birth"]) {
        Spectrum::Identity
    } else if contains_any(&["balance", "payment", "credit", "loan", "amount", "utilization"]) {
        Spectrum::Financial
    } else if lower.matches('?').count() >= 3 || contains_any(&["all fields", "everything about"])
    {
        Spectrum::MultiField
    } else if contains_any(&["earlier", "previous", "as i said", "follow up", "continue"]) {
        Spectrum::Context
    } else if contains_any(&["batch", "bulk", "all customers", "every record"]) {
        Spectrum::Scaling
    } else {
        Spectrum::Communication
    }
}

/// Apply a deployed variant: prepend its system prompt when the request
/// has none, and fill any sampling parameters the caller left unset.
/// Explicit request values always win.
fn apply_variant(request: &mut ChatRequest, variant: &PromptVariant) {
    if !request.has_system_message() {
        request
            .messages
            .insert(0, ChatMessage::system(variant.system_prompt.clone()));
    }
    let params = &variant.parameters;
    request.temperature = request.temperature.or(Some(params.temperature));
    request.top_p = request.top_p.or(Some(params.top_p));
    request.max_tokens = request.max_tokens.or(Some(params.max_tokens));
    request.presence_penalty = request.presence_penalty.or(Some(params.presence_penalty));
    request.frequency_penalty = request.frequency_penalty.or(Some(params.frequency_penalty));
}

/// The gateway's request path, shared by the HTTP handlers.
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    variants: Arc<VariantStore>,
    engine: Arc<CapabilityEngine>,
    cache: Arc<TieredCache>,
    queue: Arc<TraceQueue>,
    monitor: Arc<OperationMonitor>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        variants: Arc<VariantStore>,
        engine: Arc<CapabilityEngine>,
        cache: Arc<TieredCache>,
        queue: Arc<TraceQueue>,
        monitor: Arc<OperationMonitor>,
    ) -> Self {
        Self {
            registry,
            variants,
            engine,
            cache,
            queue,
            monitor,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Serve one chat request end to end.
    pub async fn dispatch(
        &self,
        session: &str,
        mut request: ChatRequest,
        spectrum: Spectrum,
    ) -> Result<DispatchResult, GatewayError> {
        let timer = self.monitor.start_timer("gateway.chat");
        let started = Instant::now();
        let user_input = request.last_user_content().to_string();

        // Fingerprint over the caller's normalized request, before any
        // variant mutation, so the cache key is stable across variant
        // deployments of equal content.
        let canonical =
            serde_json::to_string(&request).map_err(GatewayError::Json)?;

        if let Some(cached_bytes) = self.cache.get(CacheClass::LlmResponse, &canonical).await {
            match serde_json::from_slice::<ChatCompletion>(&cached_bytes) {
                Ok(completion) => {
                    self.emit_trace(
                        session,
                        &completion.model,
                        spectrum,
                        started.elapsed().as_millis() as u64,
                        completion.usage,
                        None,
                        &user_input,
                        &completion.content,
                        true,
                    );
                    self.monitor.end_timer(timer, true);
                    return Ok(DispatchResult {
                        latency_ms: started.elapsed().as_millis() as u64,
                        completion,
                        cached: true,
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "cached completion failed to decode, treating as miss");
                }
            }
        }

        // Experiment allocation is deterministic per request fingerprint.
        let fingerprint = stable_hash64(&canonical);
        let allocation = self
            .engine
            .board()
            .allocate(&request.model, spectrum, fingerprint);
        let variant = match allocation {
            Some((variant_id, _)) => self
                .variants
                .get(variant_id)
                .unwrap_or_else(|| self.variants.ensure_deployed(&request.model, spectrum)),
            None => self.variants.ensure_deployed(&request.model, spectrum),
        };
        apply_variant(&mut request, &variant);

        let providers = self.registry.resolve(&request.model);
        if providers.is_empty() {
            self.monitor.end_timer(timer, false);
            return Err(GatewayError::UnknownModel {
                model: request.model.clone(),
            });
        }

        // Pre-flight length check against the primary's window.
        let input_estimate = providers[0].count_tokens(&request);
        let window = providers[0].context_window();
        if input_estimate > window {
            self.monitor.end_timer(timer, false);
            return Err(GatewayError::ContextLength {
                used: input_estimate as usize,
                limit: window as usize,
            });
        }

        let (provider, response) = match self.invoke_with_failover(&providers, &request).await {
            Ok(success) => success,
            Err(err) => {
                let latency = started.elapsed().as_millis() as u64;
                self.emit_trace(
                    session,
                    &request.model,
                    spectrum,
                    latency,
                    Usage {
                        prompt_tokens: input_estimate,
                        completion_tokens: 0,
                        total_tokens: input_estimate,
                    },
                    Some(err.kind()),
                    &user_input,
                    "",
                    false,
                );
                self.monitor.end_timer(timer, false);
                return Err(err);
            }
        };

        let usage = Usage {
            prompt_tokens: response.input_tokens,
            completion_tokens: response.output_tokens,
            total_tokens: response.input_tokens + response.output_tokens,
        };
        let completion = ChatCompletion {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp().max(0) as u64,
            model: request.model.clone(),
            content: response.content,
            finish_reason: response.finish_reason,
            usage,
        };

        if let Ok(serialized) = serde_json::to_vec(&completion) {
            self.cache
                .put(CacheClass::LlmResponse, &canonical, Bytes::from(serialized))
                .await;
        }

        let latency = started.elapsed().as_millis() as u64;
        let trace_id = self.emit_trace(
            session,
            &completion.model,
            spectrum,
            latency,
            usage,
            None,
            &user_input,
            &completion.content,
            false,
        );
        if let Some((_, arm)) = allocation {
            self.engine
                .board()
                .attribute(trace_id, &request.model, spectrum, arm);
        }

        tracing::debug!(
            provider = provider.name(),
            model = %completion.model,
            latency_ms = latency,
            total_tokens = usage.total_tokens,
            "chat completion served"
        );
        self.monitor.end_timer(timer, true);
        Ok(DispatchResult {
            completion,
            cached: false,
            latency_ms: latency,
        })
    }

    /// Try providers in chain order. Non-retryable errors propagate
    /// immediately; a different provider will not fix them.
    async fn invoke_with_failover(
        &self,
        providers: &[Arc<dyn Provider>],
        request: &ChatRequest,
    ) -> Result<(Arc<dyn Provider>, super::provider::ProviderResponse), GatewayError> {
        let mut last_error: Option<GatewayError> = None;
        let chain = &providers[..providers.len().min(MAX_PROVIDERS_PER_REQUEST)];

        for (i, provider) in chain.iter().enumerate() {
            match provider.invoke(request.clone()).await {
                Ok(response) => return Ok((Arc::clone(provider), response)),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if i + 1 < chain.len() {
                        self.monitor.increment("provider_failover_total");
                        tracing::warn!(
                            provider = provider.name(),
                            next = chain[i + 1].name(),
                            error = %err,
                            "provider failed, trying next in chain"
                        );
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| GatewayError::Internal {
            reason: "empty provider chain".to_string(),
        }))
    }

    /// Build and enqueue the trace for a served (or failed) request.
    /// Never blocks: queue overflow drops the oldest envelope.
    #[allow(clippy::too_many_arguments)]
    fn emit_trace(
        &self,
        session: &str,
        model: &str,
        spectrum: Spectrum,
        latency_ms: u64,
        usage: Usage,
        error_kind: Option<&str>,
        input: &str,
        output: &str,
        cached: bool,
    ) -> Uuid {
        let mut trace = TraceRecord::new(
            session,
            model,
            spectrum,
            latency_ms,
            usage.prompt_tokens,
            usage.completion_tokens,
        );
        if let Some(kind) = error_kind {
            trace = trace.with_error(kind);
        }
        if cached {
            trace = trace.with_tag("cached");
        }
        let trace_id = trace.trace_id;
        self.queue.push(TraceEnvelope {
            trace,
            input: input.to_string(),
            output: output.to_string(),
        });
        trace_id
    }
}
