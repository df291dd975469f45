//! HTTP provider speaking the OpenAI chat-completions protocol.
//!
//! Works against any endpoint that implements the standard surface.
//! Per-request retries are NOT done here: transient failures bubble up
//! so the dispatcher can fail over to the next provider in the chain.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::provider::{ChatRequest, FinishReason, Provider, ProviderResponse};
use super::tokenizer::{estimate_message_tokens, estimate_text_tokens};
use crate::error::GatewayError;

/// Upper bound on upstream response bodies.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Per-request timeout.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    choices: Vec<UpstreamChoice>,
    #[serde(default)]
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    message: UpstreamMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// OpenAI-compatible upstream provider.
pub struct OpenAiUpstream {
    name: String,
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenAiUpstream {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: SecretString,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(GatewayError::Http)?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    /// Chat-completions URL, tolerant of base URLs with or without `/v1`.
    fn completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{base}/v1/chat/completions")
    }
}

/// Truncate at a UTF-8 character boundary for error snippets.
fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Provider for OpenAiUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        // Flat accounting estimate; billing truth lives upstream.
        (
            rust_decimal_macros::dec!(0.000002),
            rust_decimal_macros::dec!(0.000008),
        )
    }

    async fn invoke(&self, request: ChatRequest) -> Result<ProviderResponse, GatewayError> {
        let url = self.completions_url();
        tracing::debug!(provider = %self.name, %url, model = %request.model, "dispatching upstream");

        let input_estimate = estimate_message_tokens(&request.messages);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable {
                provider: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::ProviderUnavailable {
                provider: self.name.clone(),
                reason: format!("reading response body: {e}"),
            })?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(GatewayError::ProviderUnavailable {
                provider: self.name.clone(),
                reason: format!("response size {} exceeds limit", body.len()),
            });
        }

        if !status.is_success() {
            return Err(match status.as_u16() {
                429 => GatewayError::RateLimited { retry_after },
                400 if body.contains("context length") || body.contains("context_length") => {
                    GatewayError::ContextLength {
                        used: input_estimate as usize,
                        limit: self.context_window() as usize,
                    }
                }
                400..=499 => GatewayError::InvalidRequest {
                    reason: format!("upstream HTTP {status}: {}", truncate(&body, 200)),
                },
                _ => GatewayError::ProviderUnavailable {
                    provider: self.name.clone(),
                    reason: format!("HTTP {status}: {}", truncate(&body, 200)),
                },
            });
        }

        let parsed: UpstreamResponse =
            serde_json::from_str(&body).map_err(|e| GatewayError::Internal {
                reason: format!("decoding upstream response: {e}"),
            })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Internal {
                reason: "upstream returned no choices".to_string(),
            })?;
        let content = choice.message.content.unwrap_or_default();

        // Prefer upstream-reported usage; fall back to the local
        // tokenizer so accounting never goes missing.
        let (input_tokens, output_tokens) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (input_estimate, estimate_text_tokens(&content)),
        };
        let finish_reason = match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        };

        Ok(ProviderResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
        })
    }
}
