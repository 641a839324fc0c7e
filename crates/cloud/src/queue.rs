//! fal.ai queue REST client.

use std::time::Duration;

use outpaint_core::error::{OutpaintError, TransportKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_QUEUE_URL: &str = "https://queue.fal.run/fal-ai/image-apps-v2/outpaint";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// JSON body POSTed to the queue endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OutpaintPayload {
    pub image_url: String,
    pub zoom_out_percentage: u32,
    pub expand_left: u32,
    pub expand_right: u32,
    pub expand_top: u32,
    pub expand_bottom: u32,
    pub num_images: u32,
    pub prompt: String,
    pub enable_safety_checker: bool,
    pub output_format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmitReceipt {
    pub status_url: String,
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
struct RawReceipt {
    status_url: Option<String>,
    request_id: Option<String>,
}

/// Queue-side job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Error,
    Cancelled,
    Unknown(String),
}

impl QueueStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "IN_QUEUE" => Self::InQueue,
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "ERROR" => Self::Error,
            "CANCELLED" => Self::Cancelled,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Cancelled)
    }
}

/// Where a completed job's image URLs can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLocation {
    Urls(Vec<String>),
    /// Result body must be fetched from this URL first.
    ResponseUrl(String),
    Missing,
}

fn urls_from_images(images: Option<&Value>) -> Vec<String> {
    images
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|img| img.get("url").and_then(Value::as_str))
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Try `output.images`, then top-level `images`, then `response_url`.
pub fn locate_outputs(status_body: &Value) -> OutputLocation {
    let nested = urls_from_images(status_body.get("output").and_then(|o| o.get("images")));
    if !nested.is_empty() {
        return OutputLocation::Urls(nested);
    }
    let top = urls_from_images(status_body.get("images"));
    if !top.is_empty() {
        return OutputLocation::Urls(top);
    }
    match status_body.get("response_url").and_then(Value::as_str) {
        Some(url) if !url.is_empty() => OutputLocation::ResponseUrl(url.to_string()),
        _ => OutputLocation::Missing,
    }
}

/// Image URLs from a fetched `response_url` body.
pub fn urls_from_response_body(body: &Value) -> Vec<String> {
    urls_from_images(body.get("images"))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FalApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Payment required (insufficient credits): {0}")]
    PaymentRequired(String),

    #[error("Job not found (expired)")]
    Expired,

    #[error("Rate limited")]
    RateLimited,

    #[error("fal.ai API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Unexpected fal.ai response: {0}")]
    UnexpectedResponse(String),
}

impl From<FalApiError> for OutpaintError {
    fn from(err: FalApiError) -> Self {
        match err {
            FalApiError::Request(ref e) => {
                let kind = if e.is_connect() {
                    TransportKind::Connect
                } else if e.is_timeout() {
                    TransportKind::Timeout
                } else {
                    TransportKind::Other
                };
                OutpaintError::transport(kind, format!("fal.ai: {err}"))
            }
            // Server-side failures are worth another attempt.
            FalApiError::Api { status, .. } if status >= 500 => {
                OutpaintError::transport(TransportKind::Other, format!("fal.ai: {err}"))
            }
            FalApiError::PaymentRequired(body) => OutpaintError::PaymentRequired(body),
            other => OutpaintError::Execution(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FalQueueClient {
    client: reqwest::Client,
    queue_url: String,
    api_key: String,
}

impl FalQueueClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_url(reqwest::Client::new(), DEFAULT_QUEUE_URL, api_key)
    }

    pub fn with_url(client: reqwest::Client, queue_url: &str, api_key: &str) -> Self {
        Self {
            client,
            queue_url: queue_url.to_string(),
            api_key: api_key.trim().to_string(),
        }
    }

    pub fn has_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn auth(&self) -> String {
        format!("Key {}", self.api_key)
    }

    pub async fn submit(&self, payload: &OutpaintPayload) -> Result<SubmitReceipt, FalApiError> {
        let response = self
            .client
            .post(&self.queue_url)
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .json(payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::PAYMENT_REQUIRED {
            let body = response.text().await.unwrap_or_default();
            return Err(FalApiError::PaymentRequired(body));
        }
        let response = Self::ensure_success(response).await?;
        let raw: RawReceipt = response.json().await?;
        match (raw.status_url, raw.request_id) {
            (Some(status_url), Some(request_id)) if !status_url.is_empty() && !request_id.is_empty() => {
                Ok(SubmitReceipt {
                    status_url,
                    request_id,
                })
            }
            _ => Err(FalApiError::UnexpectedResponse(
                "submit response missing status_url or request_id".into(),
            )),
        }
    }

    /// Fetch the job status body. 404 means the job expired, 429 asks the
    /// caller to back off.
    pub async fn status(&self, status_url: &str) -> Result<Value, FalApiError> {
        let response = self
            .client
            .get(status_url)
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(FalApiError::Expired),
            reqwest::StatusCode::TOO_MANY_REQUESTS => Err(FalApiError::RateLimited),
            _ => {
                let response = Self::ensure_success(response).await?;
                Ok(response.json().await?)
            }
        }
    }

    /// Fetch the `response_url` indirection body.
    pub async fn result(&self, response_url: &str) -> Result<Value, FalApiError> {
        let response = self
            .client
            .get(response_url)
            .header(reqwest::header::AUTHORIZATION, self.auth())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Download a result image. Result URLs are public; no auth header.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, FalApiError> {
        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, FalApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FalApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- output shapes --

    #[test]
    fn nested_output_images_first() {
        let body = json!({
            "status": "COMPLETED",
            "output": {"images": [{"url": "https://cdn/a.png"}]},
            "images": [{"url": "https://cdn/ignored.png"}]
        });
        assert_eq!(
            locate_outputs(&body),
            OutputLocation::Urls(vec!["https://cdn/a.png".into()])
        );
    }

    #[test]
    fn top_level_images_second() {
        let body = json!({"images": [{"url": "https://cdn/b.png"}, {"content_type": "image/png"}]});
        assert_eq!(
            locate_outputs(&body),
            OutputLocation::Urls(vec!["https://cdn/b.png".into()])
        );
    }

    #[test]
    fn response_url_last() {
        let body = json!({"output": {}, "response_url": "https://queue/requests/1"});
        assert_eq!(
            locate_outputs(&body),
            OutputLocation::ResponseUrl("https://queue/requests/1".into())
        );
    }

    #[test]
    fn nothing_usable_is_missing() {
        assert_eq!(locate_outputs(&json!({"images": []})), OutputLocation::Missing);
    }

    // -- status --

    #[test]
    fn status_parsing() {
        assert_eq!(QueueStatus::parse("IN_QUEUE"), QueueStatus::InQueue);
        assert!(QueueStatus::parse("CANCELLED").is_failure());
        assert!(!QueueStatus::parse("COMPLETED").is_failure());
        assert_eq!(
            QueueStatus::parse("PAUSED"),
            QueueStatus::Unknown("PAUSED".into())
        );
    }

    // -- errors --

    #[test]
    fn payment_required_is_not_transient() {
        let err: OutpaintError = FalApiError::PaymentRequired("balance exhausted".into()).into();
        assert!(matches!(err, OutpaintError::PaymentRequired(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        let err: OutpaintError = FalApiError::Api {
            status: 503,
            body: "Service Unavailable".into(),
        }
        .into();
        assert!(err.is_transient());
        assert!(!err.is_backend_crash());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn client_errors_are_execution_failures() {
        let err: OutpaintError = FalApiError::Api {
            status: 422,
            body: "bad image_url".into(),
        }
        .into();
        assert!(matches!(err, OutpaintError::Execution(_)));
    }

    #[test]
    fn expired_is_execution_failure() {
        let err: OutpaintError = FalApiError::Expired.into();
        assert_eq!(err.to_string(), "Execution failed: Job not found (expired)");
    }
}
