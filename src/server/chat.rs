//! The chat-completions handler.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::stream::streaming_response;
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, ErrorResponse, WireChoice, WireMessageOut,
    convert_messages,
};
use super::AppState;
use crate::error::GatewayError;
use crate::gateway::{ChatRequest, classify_spectrum};
use crate::monitor::{RateDecision, Route};
use crate::trace::Spectrum;

/// Caller identity for rate limiting: forwarded-for first, else a
/// shared anonymous bucket. The extractor is pluggable at the edge
/// proxy, not here.
pub(crate) fn caller_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Map a gateway error onto the wire envelope.
pub(crate) fn gateway_error_response(err: &GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        GatewayError::InvalidRequest { .. }
        | GatewayError::UnknownModel { .. }
        | GatewayError::ContextLength { .. } => StatusCode::BAD_REQUEST,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::ProviderUnavailable { .. } | GatewayError::Http(_) => {
            StatusCode::BAD_GATEWAY
        }
        GatewayError::Internal { .. } | GatewayError::Json(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse::new(err.kind(), err.to_string())),
    )
}

pub(crate) fn rate_limited_response(retry_after: std::time::Duration) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorResponse::new("rate_limited", "rate limit exceeded")),
    )
        .into_response();
    if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

pub(crate) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = caller_key(&headers);
    if let RateDecision::Limited { retry_after } = state.limits.check(Route::Chat, &caller) {
        state.monitor.increment("rate_limited_total");
        return rate_limited_response(retry_after);
    }

    // Parse by hand so malformed bodies get the typed envelope.
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(
                    "invalid_request",
                    format!("malformed request body: {err}"),
                )),
            )
                .into_response();
        }
    };
    if request.model.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid_request", "model must be set")),
        )
            .into_response();
    }
    if request.tools.is_some() || request.tool_choice.is_some() {
        tracing::debug!("tool fields accepted but ignored");
    }

    let messages = match convert_messages(&request.messages) {
        Ok(messages) => messages,
        Err(reason) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("invalid_request", reason)),
            )
                .into_response();
        }
    };

    let mut chat_request = ChatRequest::new(request.model.clone(), messages);
    chat_request.temperature = request.temperature;
    chat_request.top_p = request.top_p;
    chat_request.max_tokens = request.max_tokens;
    chat_request.presence_penalty = request.presence_penalty;
    chat_request.frequency_penalty = request.frequency_penalty;

    let session = request
        .user
        .clone()
        .or_else(|| {
            headers
                .get("x-session-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| caller.clone());

    let spectrum = headers
        .get("x-vigil-spectrum")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Spectrum>().ok())
        .unwrap_or_else(|| classify_spectrum(chat_request.last_user_content()));

    if request.stream.unwrap_or(false) {
        return streaming_response(state, &session, chat_request, spectrum).await;
    }

    match state.dispatcher.dispatch(&session, chat_request, spectrum).await {
        Ok(result) => {
            let completion = &result.completion;
            let response_body = ChatCompletionResponse {
                id: completion.id.clone(),
                object: "chat.completion",
                created: completion.created,
                model: completion.model.clone(),
                choices: vec![WireChoice {
                    index: 0,
                    message: WireMessageOut {
                        role: "assistant",
                        content: completion.content.clone(),
                    },
                    finish_reason: completion.finish_reason.as_str(),
                }],
                usage: completion.usage,
                system_fingerprint: state.system_fingerprint.clone(),
            };
            let mut response = Json(response_body).into_response();
            let cache_status = if result.cached { "hit" } else { "miss" };
            if let Ok(value) = cache_status.parse() {
                response.headers_mut().insert("x-vigil-cache", value);
            }
            response
        }
        Err(err) => gateway_error_response(&err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(caller_key(&headers), "10.1.2.3");
        assert_eq!(caller_key(&HeaderMap::new()), "anonymous");
    }

    #[test]
    fn gateway_errors_map_to_documented_statuses() {
        let (status, Json(body)) = gateway_error_response(&GatewayError::RateLimited {
            retry_after: None,
        });
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.error.kind, "rate_limited");

        let (status, Json(body)) = gateway_error_response(&GatewayError::ProviderUnavailable {
            provider: "p".into(),
            reason: "down".into(),
        });
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.error.kind, "provider_unavailable");

        let (status, _) = gateway_error_response(&GatewayError::ContextLength {
            used: 100,
            limit: 10,
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, Json(body)) = gateway_error_response(&GatewayError::Internal {
            reason: "x".into(),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error.kind, "internal");
    }
}
