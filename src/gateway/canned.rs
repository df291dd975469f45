//! Deterministic local provider for offline operation and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::provider::{ChatRequest, FinishReason, Provider, ProviderResponse};
use super::tokenizer::{estimate_message_tokens, estimate_text_tokens};
use crate::error::GatewayError;

/// Model id announced when no models were configured for the provider.
pub const DEFAULT_MODEL: &str = "canned-mini";

/// A provider that answers from a fixed template.
///
/// The response is a pure function of the request, which keeps cache
/// byte-identity and A/B allocation tests deterministic, and lets the
/// gateway boot with no upstream credentials at all.
pub struct CannedProvider {
    name: String,
    context_window: u32,
}

impl CannedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context_window: 8_192,
        }
    }
}

#[async_trait]
impl Provider for CannedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn invoke(&self, request: ChatRequest) -> Result<ProviderResponse, GatewayError> {
        let input_tokens = estimate_message_tokens(&request.messages);
        let prompt = request.last_user_content();
        if prompt.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "no user message to answer".to_string(),
            });
        }

        let mut content = format!("Acknowledged: {}", prompt.chars().take(160).collect::<String>());
        let mut finish_reason = FinishReason::Stop;

        // Honor max_tokens the way a real provider would: truncate and
        // report `length`.
        if let Some(max_tokens) = request.max_tokens {
            let budget_chars = (max_tokens as usize) * 4;
            if content.chars().count() > budget_chars {
                content = content.chars().take(budget_chars.max(1)).collect();
                finish_reason = FinishReason::Length;
            }
        }

        let output_tokens = estimate_text_tokens(&content);
        Ok(ProviderResponse {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
        })
    }
}
