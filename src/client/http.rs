//! Remote HTTP backend for the request queue.
//!
//! All responses arrive wrapped in a `{"data": ...}` envelope.  Transport
//! failures, unparseable bodies, 5xx responses and rate limits are retried
//! with exponential backoff and full jitter; other API errors surface as
//! [`ApiError`] immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{benign_not_found_to_none, ApiError};
use crate::request::Request;

use super::{
    BatchOperationResults, ListHeadResult, QueueInfo, QueueOperationInfo, RequestListPage,
    RequestQueueClient,
};

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

/// Shared connection to the remote service; hands out per-queue clients.
pub struct HttpApiClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
    max_retries: u32,
    min_retry_delay: Duration,
}

impl HttpApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let token = config
            .token
            .clone()
            .context("an API token is required for remote storage")?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("crawlqueue/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token,
            http,
            max_retries: config.max_retries,
            min_retry_delay: Duration::from_millis(config.min_retry_delay_ms),
        })
    }

    /// Fetch queue metadata by id, or `None` if the id does not exist.
    pub async fn get_queue(&self, queue_id: &str) -> Result<Option<QueueInfo>> {
        let result = self
            .call(
                Method::GET,
                &format!("request-queues/{queue_id}"),
                &[],
                None,
            )
            .await;
        match benign_not_found_to_none(result)? {
            Some(data) => Ok(Some(parse_data(data)?)),
            None => Ok(None),
        }
    }

    /// Fetch a queue by name, creating it if it does not exist yet.
    pub async fn get_or_create_queue(&self, name: &str) -> Result<QueueInfo> {
        let data = self
            .call(
                Method::POST,
                "request-queues",
                &[("name", name.to_string())],
                None,
            )
            .await?;
        parse_data(data)
    }

    /// Build the per-queue client carrying this coordinator's `clientKey`.
    pub fn queue_client(self: &Arc<Self>, queue_id: &str, client_key: &str) -> HttpQueueClient {
        HttpQueueClient {
            api: Arc::clone(self),
            queue_id: queue_id.to_string(),
            client_key: client_key.to_string(),
        }
    }

    /// Perform one API call with retries, returning the `data` payload.
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/v2/{path}", self.base_url);
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                let jitter = rand::thread_rng().gen_range(0.0..1.0);
                let delay = backoff_delay(self.min_retry_delay, attempt, jitter);
                debug!(%url, attempt, delay_ms = delay.as_millis() as u64, "retrying API call");
                tokio::time::sleep(delay).await;
            }

            let mut builder = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", format!("Bearer {}", self.token))
                .query(query);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    // Network error or timeout; retryable.
                    last_error = Some(anyhow::Error::new(err).context("API request failed"));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                if status == StatusCode::NO_CONTENT {
                    return Ok(serde_json::Value::Null);
                }
                let bytes = match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        last_error =
                            Some(anyhow::Error::new(err).context("failed to read response body"));
                        continue;
                    }
                };
                if bytes.is_empty() {
                    return Ok(serde_json::Value::Null);
                }
                match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(envelope) => return Ok(envelope.data),
                    Err(err) => {
                        // Partial or malformed body; retryable.
                        last_error =
                            Some(anyhow::Error::new(err).context("invalid API response body"));
                        continue;
                    }
                }
            }

            let api_error = parse_error_response(status, &response.bytes().await.ok(), attempt);
            if api_error.is_retryable() {
                warn!(
                    %url,
                    status = api_error.status_code,
                    kind = %api_error.kind,
                    attempt,
                    "retryable API error"
                );
                last_error = Some(api_error.into());
                continue;
            }
            return Err(api_error.into());
        }

        Err(last_error
            .map(|err| err.context(format!("API call failed after {} attempts", self.max_retries)))
            .unwrap_or_else(|| anyhow::anyhow!("API call failed with no attempts")))
    }
}

/// Exponential backoff with full jitter: `min_delay * 2^(attempt-2) * (1 + jitter)`.
fn backoff_delay(min_delay: Duration, attempt: u32, jitter: f64) -> Duration {
    let base = min_delay.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(2) as i32);
    Duration::from_millis((base * (1.0 + jitter)) as u64)
}

fn parse_error_response(
    status: StatusCode,
    body: &Option<bytes::Bytes>,
    attempt: u32,
) -> ApiError {
    let parsed = body
        .as_deref()
        .and_then(|bytes| serde_json::from_slice::<ErrorEnvelope>(bytes).ok());
    match parsed {
        Some(envelope) => ApiError {
            status_code: status.as_u16(),
            kind: envelope.error.kind,
            message: envelope.error.message,
            attempt,
        },
        None => ApiError {
            status_code: status.as_u16(),
            kind: "unknown".to_string(),
            message: format!("unexpected status {status}"),
            attempt,
        },
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data).context("unexpected shape of API response data")
}

// ---------------------------------------------------------------------------
// Per-queue client
// ---------------------------------------------------------------------------

/// [`RequestQueueClient`] implementation speaking to the remote service.
pub struct HttpQueueClient {
    api: Arc<HttpApiClient>,
    queue_id: String,
    client_key: String,
}

impl HttpQueueClient {
    fn queue_path(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("request-queues/{}", self.queue_id)
        } else {
            format!("request-queues/{}/{suffix}", self.queue_id)
        }
    }

    fn client_key_param(&self) -> (&'static str, String) {
        ("clientKey", self.client_key.clone())
    }
}

#[async_trait::async_trait]
impl RequestQueueClient for HttpQueueClient {
    async fn get(&self) -> Result<Option<QueueInfo>> {
        let result = self
            .api
            .call(Method::GET, &self.queue_path(""), &[], None)
            .await;
        match benign_not_found_to_none(result)? {
            Some(data) => Ok(Some(parse_data(data)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, name: &str) -> Result<QueueInfo> {
        let body = serde_json::json!({ "name": name });
        let data = self
            .api
            .call(Method::PUT, &self.queue_path(""), &[], Some(&body))
            .await?;
        parse_data(data)
    }

    async fn delete(&self) -> Result<()> {
        let result = self
            .api
            .call(Method::DELETE, &self.queue_path(""), &[], None)
            .await;
        benign_not_found_to_none(result)?;
        Ok(())
    }

    async fn list_head(&self, limit: usize) -> Result<ListHeadResult> {
        let data = self
            .api
            .call(
                Method::GET,
                &self.queue_path("head"),
                &[("limit", limit.to_string()), self.client_key_param()],
                None,
            )
            .await?;
        parse_data(data)
    }

    async fn list_and_lock_head(&self, lock_secs: u64, limit: usize) -> Result<ListHeadResult> {
        let data = self
            .api
            .call(
                Method::POST,
                &self.queue_path("head/lock"),
                &[
                    ("lockSecs", lock_secs.to_string()),
                    ("limit", limit.to_string()),
                    self.client_key_param(),
                ],
                None,
            )
            .await?;
        parse_data(data)
    }

    async fn add_request(&self, request: &Request, forefront: bool) -> Result<QueueOperationInfo> {
        let body = serde_json::to_value(request)?;
        let data = self
            .api
            .call(
                Method::POST,
                &self.queue_path("requests"),
                &[("forefront", forefront.to_string()), self.client_key_param()],
                Some(&body),
            )
            .await?;
        parse_data(data)
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<Request>> {
        let result = self
            .api
            .call(
                Method::GET,
                &self.queue_path(&format!("requests/{request_id}")),
                &[],
                None,
            )
            .await;
        match benign_not_found_to_none(result)? {
            Some(serde_json::Value::Null) => Ok(None),
            Some(data) => Ok(Some(parse_data(data)?)),
            None => Ok(None),
        }
    }

    async fn update_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo> {
        let request_id = request
            .id
            .as_deref()
            .context("cannot update a request without an id")?;
        let body = serde_json::to_value(request)?;
        let data = self
            .api
            .call(
                Method::PUT,
                &self.queue_path(&format!("requests/{request_id}")),
                &[("forefront", forefront.to_string()), self.client_key_param()],
                Some(&body),
            )
            .await?;
        parse_data(data)
    }

    async fn delete_request(&self, request_id: &str) -> Result<()> {
        let result = self
            .api
            .call(
                Method::DELETE,
                &self.queue_path(&format!("requests/{request_id}")),
                &[self.client_key_param()],
                None,
            )
            .await;
        benign_not_found_to_none(result)?;
        Ok(())
    }

    async fn prolong_request_lock(
        &self,
        request_id: &str,
        lock_secs: u64,
        forefront: bool,
    ) -> Result<()> {
        self.api
            .call(
                Method::PUT,
                &self.queue_path(&format!("requests/{request_id}/lock")),
                &[
                    ("lockSecs", lock_secs.to_string()),
                    ("forefront", forefront.to_string()),
                    self.client_key_param(),
                ],
                None,
            )
            .await?;
        Ok(())
    }

    async fn delete_request_lock(&self, request_id: &str, forefront: bool) -> Result<()> {
        self.api
            .call(
                Method::DELETE,
                &self.queue_path(&format!("requests/{request_id}/lock")),
                &[("forefront", forefront.to_string()), self.client_key_param()],
                None,
            )
            .await?;
        Ok(())
    }

    async fn batch_add_requests(
        &self,
        requests: &[Request],
        forefront: bool,
    ) -> Result<BatchOperationResults> {
        let body = serde_json::to_value(requests)?;
        let data = self
            .api
            .call(
                Method::POST,
                &self.queue_path("requests/batch"),
                &[("forefront", forefront.to_string()), self.client_key_param()],
                Some(&body),
            )
            .await?;
        parse_data(data)
    }

    async fn batch_delete_requests(&self, request_ids: &[String]) -> Result<BatchOperationResults> {
        let body = serde_json::to_value(request_ids)?;
        let data = self
            .api
            .call(
                Method::DELETE,
                &self.queue_path("requests/batch"),
                &[self.client_key_param()],
                Some(&body),
            )
            .await?;
        parse_data(data)
    }

    async fn list_requests(
        &self,
        limit: usize,
        exclusive_start_id: Option<&str>,
    ) -> Result<RequestListPage> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(start) = exclusive_start_id {
            query.push(("exclusiveStartId", start.to_string()));
        }
        let data = self
            .api
            .call(Method::GET, &self.queue_path("requests"), &query, None)
            .await?;
        parse_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Backoff ─────────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 2, 0.0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3, 0.0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(base, 4, 0.0), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(base, 8, 0.0), Duration::from_millis(32_000));
    }

    #[test]
    fn jitter_extends_delay_up_to_double() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 2, 1.0), Duration::from_millis(1_000));
        let jittered = backoff_delay(base, 2, 0.5);
        assert_eq!(jittered, Duration::from_millis(750));
    }

    // ── Error parsing ───────────────────────────────────────────────────

    #[test]
    fn parses_service_error_envelope() {
        let body = br#"{"error":{"type":"record-not-found","message":"no such queue"}}"#;
        let err = parse_error_response(
            StatusCode::NOT_FOUND,
            &Some(bytes::Bytes::copy_from_slice(body)),
            3,
        );
        assert_eq!(err.status_code, 404);
        assert_eq!(err.kind, "record-not-found");
        assert_eq!(err.message, "no such queue");
        assert_eq!(err.attempt, 3);
        assert!(err.is_benign_not_found());
    }

    #[test]
    fn unparseable_error_body_falls_back_to_status() {
        let err = parse_error_response(StatusCode::BAD_GATEWAY, &None, 1);
        assert_eq!(err.status_code, 502);
        assert_eq!(err.kind, "unknown");
        assert!(err.is_retryable());
    }
}
