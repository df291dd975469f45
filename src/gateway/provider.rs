//! Provider trait and the normalized request/response types.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::tokenizer::estimate_message_tokens;
use crate::error::GatewayError;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Normalized chat request handed to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
        }
    }

    /// Last user message, the primary signal for classification and
    /// exemplar matching.
    pub fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }

    pub fn has_system_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::System)
    }
}

/// Why the completion finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

/// A provider's completed response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

/// Uniform contract over upstream LLM backends.
///
/// Providers return complete responses; the server synthesizes SSE
/// chunking with pacing on top. Registration happens once at boot under
/// a string key.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key, also reported as `owned_by` in model listings.
    fn name(&self) -> &str;

    /// Cost per (input, output) token.
    fn cost_per_token(&self) -> (Decimal, Decimal);

    /// Context window in tokens, used for pre-flight length checks.
    fn context_window(&self) -> u32 {
        128_000
    }

    /// Count input tokens for a request with this provider's tokenizer.
    fn count_tokens(&self, request: &ChatRequest) -> u32 {
        estimate_message_tokens(&request.messages)
    }

    /// Execute a chat completion.
    async fn invoke(&self, request: ChatRequest) -> Result<ProviderResponse, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_content_picks_most_recent() {
        let request = ChatRequest::new(
            "m",
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("first"),
                ChatMessage::assistant("reply"),
                ChatMessage::user("second"),
            ],
        );
        assert_eq!(request.last_user_content(), "second");
    }

    #[test]
    fn last_user_content_empty_without_user_messages() {
        let request = ChatRequest::new("m", vec![ChatMessage::system("sys")]);
        assert_eq!(request.last_user_content(), "");
        assert!(request.has_system_message());
    }
}
