//! SSE streaming for chat completions.
//!
//! Providers return complete responses; this module chunks them into an
//! ordered delta stream with pacing derived from the observed serving
//! rate, terminated by exactly one `data: [DONE]` sentinel. Cache hits
//! replay through the same path with the `x-vigil-cache: hit` marker.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};

use super::chat::gateway_error_response;
use super::types::{ChatChunk, ChunkChoice, Delta};
use super::AppState;
use crate::gateway::{ChatRequest, DispatchResult};
use crate::trace::Spectrum;

/// Upper bound on inter-chunk pacing.
const MAX_CHUNK_DELAY: Duration = Duration::from_millis(20);

/// Characters grouped per content chunk.
const CHUNK_CHARS: usize = 20;

/// Derive the inter-chunk delay from the observed serving rate, capped
/// for fast providers. Cached replays pace at the cap floor.
fn pacing_delay(result: &DispatchResult) -> Duration {
    let tokens = u64::from(result.completion.usage.completion_tokens).max(1);
    let per_token_ms = result.latency_ms / tokens;
    Duration::from_millis(per_token_ms.clamp(1, MAX_CHUNK_DELAY.as_millis() as u64))
}

/// Split content into word-boundary chunks of roughly `CHUNK_CHARS`.
fn content_chunks(content: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    for word in content.split_inclusive(char::is_whitespace) {
        buf.push_str(word);
        if buf.chars().count() >= CHUNK_CHARS {
            chunks.push(std::mem::take(&mut buf));
        }
    }
    if !buf.is_empty() {
        chunks.push(buf);
    }
    chunks
}

pub(crate) async fn streaming_response(
    state: Arc<AppState>,
    session: &str,
    request: ChatRequest,
    spectrum: Spectrum,
) -> Response {
    // Execute before the stream starts so failures surface as proper
    // HTTP errors instead of mid-stream drops.
    let result = match state.dispatcher.dispatch(session, request, spectrum).await {
        Ok(result) => result,
        Err(err) => return gateway_error_response(&err).into_response(),
    };

    let delay = pacing_delay(&result);
    let cached = result.cached;
    let completion = result.completion;
    let fingerprint = state.system_fingerprint.clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(async move {
        let chunk = |delta: Delta, finish: Option<&'static str>| ChatChunk {
            id: completion.id.clone(),
            object: "chat.completion.chunk",
            created: completion.created,
            model: completion.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            system_fingerprint: Some(fingerprint.clone()),
        };
        let send = |event: ChatChunk| {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Event::default().data(data)
        };

        // Leading chunk carries the role.
        if tx
            .send(Ok(send(chunk(
                Delta {
                    role: Some("assistant"),
                    content: None,
                },
                None,
            ))))
            .await
            .is_err()
        {
            return;
        }

        for piece in content_chunks(&completion.content) {
            tokio::time::sleep(delay).await;
            if tx
                .send(Ok(send(chunk(
                    Delta {
                        role: None,
                        content: Some(piece),
                    },
                    None,
                ))))
                .await
                .is_err()
            {
                return;
            }
        }

        // Final chunk carries the finish reason, then the sentinel.
        let _ = tx
            .send(Ok(send(chunk(
                Delta::default(),
                Some(completion.finish_reason.as_str()),
            ))))
            .await;
        let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().text(""));
    let mut response = sse.into_response();
    let cache_status = if cached { "hit" } else { "miss" };
    if let Ok(value) = cache_status.parse() {
        response.headers_mut().insert("x-vigil-cache", value);
    }
    response
}
