//! Wire types for the OpenAI-compatible surface.

use serde::{Deserialize, Serialize};

use crate::gateway::{ChatMessage, Role, Usage};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// OpenAI's end-user identifier; doubles as the session key.
    #[serde(default)]
    pub user: Option<String>,
    /// Accepted for wire compatibility; tool execution is not part of
    /// this gateway.
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<WireContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl WireContent {
    /// Flatten structured content to plain text.
    pub fn flatten(&self) -> String {
        match self {
            WireContent::Text(text) => text.clone(),
            WireContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Convert wire messages into the normalized gateway form.
pub fn convert_messages(messages: &[WireMessage]) -> Result<Vec<ChatMessage>, String> {
    if messages.is_empty() {
        return Err("messages must not be empty".to_string());
    }
    messages
        .iter()
        .map(|m| {
            let role = match m.role.as_str() {
                "system" | "developer" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                other => return Err(format!("unknown role '{other}'")),
            };
            let content = m.content.as_ref().map(WireContent::flatten).unwrap_or_default();
            Ok(ChatMessage { role, content })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Response types (non-streaming)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<WireChoice>,
    pub usage: Usage,
    pub system_fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct WireChoice {
    pub index: u32,
    pub message: WireMessageOut,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct WireMessageOut {
    pub role: &'static str,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Response types (streaming)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize, Default)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Error envelope and model listing
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.into(),
                code: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_rejects_empty_messages() {
        assert!(convert_messages(&[]).is_err());
    }

    #[test]
    fn convert_rejects_unknown_roles() {
        let messages = vec![WireMessage {
            role: "wizard".to_string(),
            content: Some(WireContent::Text("hi".into())),
        }];
        assert!(convert_messages(&messages).is_err());
    }

    #[test]
    fn convert_flattens_part_content() {
        let messages = vec![WireMessage {
            role: "user".to_string(),
            content: Some(WireContent::Parts(vec![
                WirePart {
                    part_type: "text".to_string(),
                    text: Some("hello ".into()),
                },
                WirePart {
                    part_type: "text".to_string(),
                    text: Some("world".into()),
                },
            ])),
        }];
        let converted = convert_messages(&messages).unwrap();
        assert_eq!(converted[0].content, "hello world");
        assert_eq!(converted[0].role, Role::User);
    }

    #[test]
    fn request_parses_minimal_body() {
        let body = r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"ping"}]}"#;
        let request: ChatCompletionRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert!(request.stream.is_none());
    }

    #[test]
    fn error_envelope_shape() {
        let response = ErrorResponse::new("rate_limited", "slow down");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["kind"], "rate_limited");
        assert_eq!(json["error"]["message"], "slow down");
        assert!(json["error"].get("code").is_none());
    }
}
