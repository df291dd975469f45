//! HTTPS client for the trace backend.
//!
//! Every call carries both credential headers, a per-call timeout, and
//! passes through a local request budget before touching the network.
//! Transient failures retry with full-jitter exponential backoff.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;

use super::types::{
    AggregateStats, AnnotationItem, AnnotationQueueInfo, DatasetExample, ExportFormat,
    ExportStatus, GroupBy, RunPage, RunQuery, RunRecord, WorkspaceStats,
};
use super::TraceBackend;
use crate::config::ObservabilityConfig;
use crate::error::ObservabilityError;

/// Server-side page cap for run listing.
const LIST_RUNS_SERVER_CAP: usize = 100;

/// Initial backoff delay.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(4);

#[derive(serde::Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(serde::Deserialize)]
struct AddedResponse {
    added: usize,
}

#[derive(serde::Deserialize)]
struct QueuesResponse {
    queues: Vec<AnnotationQueueInfo>,
}

/// Local sliding-window request budget.
///
/// Callers over budget are suspended until the window rolls, never
/// failed: backpressure instead of errors.
struct RequestBudget {
    cap: u32,
    window: Duration,
    state: Mutex<BudgetWindow>,
}

struct BudgetWindow {
    started: Instant,
    used: u32,
}

impl RequestBudget {
    fn new(cap: u32, window: Duration) -> Self {
        Self {
            cap,
            window,
            state: Mutex::new(BudgetWindow {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let elapsed = now.duration_since(state.started);
                if elapsed >= self.window {
                    state.started = now;
                    state.used = 0;
                }
                if state.used < self.cap {
                    state.used += 1;
                    None
                } else {
                    Some(self.window - elapsed)
                }
            };
            match wait {
                None => return,
                Some(delay) => {
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "backend request budget exhausted, suspending caller");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Classify a non-success HTTP response into the error taxonomy.
fn classify(status: u16, retry_after: Option<Duration>, resource: &str, body: String) -> ObservabilityError {
    match status {
        401 | 403 => ObservabilityError::Auth { status },
        404 => ObservabilityError::NotFound {
            resource: resource.to_string(),
        },
        429 => ObservabilityError::RateLimited { retry_after },
        500..=599 => ObservabilityError::Transient {
            reason: format!("HTTP {status}: {}", truncate(&body, 200)),
        },
        _ => ObservabilityError::Rejected {
            status,
            body: truncate(&body, 200).to_string(),
        },
    }
}

/// Truncate at a UTF-8 character boundary.
fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Full-jitter backoff delay for the given attempt.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_INITIAL
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

/// The HTTPS trace-backend client.
pub struct ObservabilityClient {
    http: reqwest::Client,
    config: ObservabilityConfig,
    budget: RequestBudget,
}

impl ObservabilityClient {
    pub fn new(config: ObservabilityConfig) -> Result<Self, ObservabilityError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(ObservabilityError::Http)?;
        let budget = RequestBudget::new(config.request_budget_per_min, Duration::from_secs(60));
        Ok(Self {
            http,
            config,
            budget,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Issue one request with budget, credentials, timeout, and retries.
    async fn request_json<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> Result<R, ObservabilityError> {
        let url = self.url(path);

        for attempt in 0..=self.config.max_retries {
            self.budget.acquire().await;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("X-Api-Key", self.config.api_key.expose_secret())
                .header("X-Organization-Id", &self.config.org_id)
                .timeout(timeout)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            let err = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<R>().await.map_err(|e| {
                            ObservabilityError::Protocol {
                                reason: format!("decoding {path}: {e}"),
                            }
                        });
                    }
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let text = response.text().await.unwrap_or_default();
                    classify(status.as_u16(), retry_after, path, text)
                }
                Err(e) => ObservabilityError::Http(e),
            };

            if !err.is_retryable() || attempt == self.config.max_retries {
                return Err(err);
            }

            let delay = err.retry_after().unwrap_or_else(|| backoff_delay(attempt));
            tracing::warn!(
                path,
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying backend request after transient error"
            );
            tokio::time::sleep(delay).await;
        }

        // The loop returns on the final attempt.
        unreachable!("retry loop always returns from within its body")
    }
}

#[async_trait]
impl TraceBackend for ObservabilityClient {
    async fn list_runs(&self, query: RunQuery) -> Result<RunPage, ObservabilityError> {
        let mut params: Vec<(&str, String)> = vec![(
            "limit",
            query.limit.clamp(1, LIST_RUNS_SERVER_CAP).to_string(),
        )];
        // Ascending replay order when a lower bound is given, newest-first
        // otherwise.
        params.push(("order", if query.since.is_some() { "asc" } else { "desc" }.to_string()));
        if let Some(session) = &query.session {
            params.push(("session", session.clone()));
        }
        if let Some(since) = &query.since {
            params.push(("since", since.to_rfc3339()));
        }
        if let Some(until) = &query.until {
            params.push(("until", until.to_rfc3339()));
        }
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.clone()));
        }
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }

        self.request_json(Method::GET, "runs", &params, None, self.config.short_timeout)
            .await
    }

    async fn get_run_stats(
        &self,
        session: Option<&str>,
        group_by: GroupBy,
    ) -> Result<AggregateStats, ObservabilityError> {
        let group = match group_by {
            GroupBy::Model => "model",
            GroupBy::Spectrum => "spectrum",
            GroupBy::Hour => "hour",
            GroupBy::None => "none",
        };
        let mut params = vec![("group_by", group.to_string())];
        if let Some(session) = session {
            params.push(("session", session.to_string()));
        }
        self.request_json(
            Method::GET,
            "runs/stats",
            &params,
            None,
            self.config.short_timeout,
        )
        .await
    }

    async fn submit_feedback(
        &self,
        run_id: &str,
        score: f64,
        comment: Option<&str>,
    ) -> Result<(), ObservabilityError> {
        if !(0.0..=1.0).contains(&score) {
            return Err(ObservabilityError::Protocol {
                reason: format!("feedback score {score} outside [0, 1]"),
            });
        }
        let body = serde_json::json!({ "score": score, "comment": comment });
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("runs/{run_id}/feedback"),
                &[],
                Some(&body),
                self.config.short_timeout,
            )
            .await?;
        Ok(())
    }

    async fn create_dataset(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, ObservabilityError> {
        let body = serde_json::json!({ "name": name, "description": description });
        let resp: IdResponse = self
            .request_json(
                Method::POST,
                "datasets",
                &[],
                Some(&body),
                self.config.short_timeout,
            )
            .await?;
        Ok(resp.id)
    }

    async fn add_examples(
        &self,
        dataset_id: &str,
        examples: &[DatasetExample],
    ) -> Result<usize, ObservabilityError> {
        let body = serde_json::json!({ "examples": examples });
        let resp: AddedResponse = self
            .request_json(
                Method::POST,
                &format!("datasets/{dataset_id}/examples"),
                &[],
                Some(&body),
                self.config.bulk_timeout,
            )
            .await?;
        Ok(resp.added)
    }

    async fn start_bulk_export(
        &self,
        query: RunQuery,
        format: ExportFormat,
    ) -> Result<String, ObservabilityError> {
        let body = serde_json::json!({ "query": query, "format": format });
        let resp: IdResponse = self
            .request_json(
                Method::POST,
                "exports",
                &[],
                Some(&body),
                self.config.bulk_timeout,
            )
            .await?;
        Ok(resp.id)
    }

    async fn poll_bulk_export(&self, export_id: &str) -> Result<ExportStatus, ObservabilityError> {
        self.request_json(
            Method::GET,
            &format!("exports/{export_id}"),
            &[],
            None,
            self.config.short_timeout,
        )
        .await
    }

    async fn fetch_export(&self, url: &str) -> Result<Vec<RunRecord>, ObservabilityError> {
        self.budget.acquire().await;
        let response = self
            .http
            .get(url)
            .header("X-Api-Key", self.config.api_key.expose_secret())
            .header("X-Organization-Id", &self.config.org_id)
            .timeout(self.config.bulk_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status.as_u16(), None, url, body));
        }
        let text = response.text().await?;
        // Exports consumed internally are always ndjson: one run per line.
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| ObservabilityError::Protocol {
                    reason: format!("export line: {e}"),
                })
            })
            .collect()
    }

    async fn list_annotation_queues(
        &self,
    ) -> Result<Vec<AnnotationQueueInfo>, ObservabilityError> {
        let resp: QueuesResponse = self
            .request_json(
                Method::GET,
                "annotation-queues",
                &[],
                None,
                self.config.short_timeout,
            )
            .await?;
        Ok(resp.queues)
    }

    async fn enqueue_annotation(
        &self,
        queue_id: &str,
        item: AnnotationItem,
    ) -> Result<(), ObservabilityError> {
        let body = serde_json::to_value(&item)?;
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("annotation-queues/{queue_id}/items"),
                &[],
                Some(&body),
                self.config.short_timeout,
            )
            .await?;
        Ok(())
    }

    async fn workspace_stats(&self) -> Result<WorkspaceStats, ObservabilityError> {
        self.request_json(
            Method::GET,
            "workspace/stats",
            &[],
            None,
            self.config.short_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_status_codes() {
        assert!(matches!(
            classify(401, None, "runs", String::new()),
            ObservabilityError::Auth { status: 401 }
        ));
        assert!(matches!(
            classify(403, None, "runs", String::new()),
            ObservabilityError::Auth { status: 403 }
        ));
        assert!(matches!(
            classify(404, None, "runs/abc", String::new()),
            ObservabilityError::NotFound { .. }
        ));
        assert!(matches!(
            classify(429, Some(Duration::from_secs(3)), "runs", String::new()),
            ObservabilityError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            classify(503, None, "runs", "overloaded".into()),
            ObservabilityError::Transient { .. }
        ));
        assert!(matches!(
            classify(422, None, "runs", "bad filter".into()),
            ObservabilityError::Rejected { status: 422, .. }
        ));
    }

    #[test]
    fn classified_errors_follow_retry_policy() {
        assert!(classify(500, None, "p", String::new()).is_retryable());
        assert!(classify(429, None, "p", String::new()).is_retryable());
        assert!(!classify(401, None, "p", String::new()).is_retryable());
        assert!(!classify(404, None, "p", String::new()).is_retryable());
        assert!(!classify(400, None, "p", String::new()).is_retryable());
    }

    #[test]
    fn backoff_is_jittered_and_capped() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt);
            assert!(delay <= BACKOFF_MAX, "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("short", 100), "short");
    }

    #[tokio::test]
    async fn budget_suspends_after_cap() {
        let budget = RequestBudget::new(2, Duration::from_millis(50));
        let start = Instant::now();
        budget.acquire().await;
        budget.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(40), "first two are immediate");
        // Third acquisition waits for the window to roll.
        budget.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(40),
            "third acquisition suspended until the window rolled"
        );
    }
}
