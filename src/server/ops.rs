//! Operational endpoints: health, metrics, model listing, and the
//! virtuous-cycle control surface.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use super::chat::{caller_key, rate_limited_response};
use super::types::{ErrorResponse, ModelEntry, ModelList};
use super::AppState;
use crate::monitor::{RateDecision, Route};
use crate::trace::Spectrum;

fn check_route(state: &AppState, headers: &HeaderMap, route: Route) -> Option<Response> {
    let caller = caller_key(headers);
    if let RateDecision::Limited { retry_after } = state.limits.check(route, &caller) {
        state.monitor.increment("rate_limited_total");
        return Some(rate_limited_response(retry_after));
    }
    None
}

pub(crate) async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Models) {
        return limited;
    }
    let data = state
        .registry
        .models()
        .into_iter()
        .map(|m| ModelEntry {
            id: m.id,
            object: "model",
            created: m.created,
            owned_by: m.owned_by,
        })
        .collect();
    Json(ModelList {
        object: "list",
        data,
    })
    .into_response()
}

pub(crate) async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Health) {
        return limited;
    }
    let status = if state.manager.status().monitoring_active {
        "ok"
    } else {
        "degraded"
    };
    Json(serde_json::json!({ "status": status })).into_response()
}

pub(crate) async fn health_detailed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Health) {
        return limited;
    }
    let cycle = state.manager.status();
    let snapshot = state.monitor.snapshot();
    let last_success: serde_json::Value = snapshot
        .ops
        .iter()
        .map(|(op, stats)| (op.clone(), serde_json::json!(stats.last_success_at)))
        .collect::<serde_json::Map<_, _>>()
        .into();

    Json(serde_json::json!({
        "status": if cycle.monitoring_active { "ok" } else { "degraded" },
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "components": cycle.component_status,
        "cache": state.cache.stats(),
        "last_success": last_success,
    }))
    .into_response()
}

pub(crate) async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Metrics) {
        return limited;
    }
    let cycle = state.manager.status();
    Json(serde_json::json!({
        "cache": state.cache.stats(),
        "operations": state.monitor.snapshot(),
        "cycle": cycle.metrics,
        "experiments": state.manager.experiments(),
        "alerts": state.manager.alerts().recent(20),
    }))
    .into_response()
}

pub(crate) async fn cycle_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Metrics) {
        return limited;
    }
    Json(state.manager.status()).into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct TriggerRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub(crate) async fn cycle_trigger(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Metrics) {
        return limited;
    }
    let request: TriggerRequest = serde_json::from_slice(&body).unwrap_or(TriggerRequest {
        reason: None,
    });
    let reason = request
        .reason
        .unwrap_or_else(|| "manual trigger".to_string());
    let (accepted, detail) = state.manager.trigger(&reason);
    Json(serde_json::json!({ "accepted": accepted, "reason": detail })).into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct RollbackRequest {
    model: String,
    spectrum: String,
}

/// Operator-initiated rollback: re-deploy the predecessor of the
/// currently deployed variant for a key.
pub(crate) async fn cycle_rollback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Metrics) {
        return limited;
    }
    let request: RollbackRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(
                    "invalid_request",
                    format!("malformed rollback request: {err}"),
                )),
            )
                .into_response();
        }
    };
    let spectrum: Spectrum = match request.spectrum.parse() {
        Ok(spectrum) => spectrum,
        Err(reason) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("invalid_request", reason)),
            )
                .into_response();
        }
    };

    match state.manager.variants().rollback(&request.model, spectrum) {
        Ok(restored) => Json(serde_json::json!({ "restored": restored })).into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse::new("invalid_request", err.to_string())),
        )
            .into_response(),
    }
}

pub(crate) async fn cycle_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Some(limited) = check_route(&state, &headers, Route::Metrics) {
        return limited;
    }
    Json(serde_json::json!({
        "changes": state.manager.variants().changes(100),
    }))
    .into_response()
}
