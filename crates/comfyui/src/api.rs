//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps status, introspection, upload, submission, history and image
//! retrieval using [`reqwest`].

use std::path::Path;
use std::time::Duration;

use outpaint_core::error::{OutpaintError, TransportKind};
use serde::Deserialize;

use crate::workflow::WorkflowGraph;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);
const VIEW_TIMEOUT: Duration = Duration::from_secs(120);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `/prompt` after queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    name: Option<String>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A 2xx response whose body did not have the expected shape.
    #[error("Unexpected ComfyUI response: {0}")]
    UnexpectedResponse(String),

    #[error("Cannot read {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
}

impl ComfyUIApiError {
    /// Transport failures are classified by how the request failed. A 5xx
    /// status counts as one; other statuses do not.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        match self {
            Self::Request(e) if e.is_connect() => Some(TransportKind::Connect),
            Self::Request(e) if e.is_timeout() => Some(TransportKind::Timeout),
            Self::Request(e) if e.is_decode() => None,
            Self::Request(_) => Some(TransportKind::Other),
            Self::ApiError { status, .. } if *status >= 500 => Some(TransportKind::Other),
            _ => None,
        }
    }
}

impl From<ComfyUIApiError> for OutpaintError {
    fn from(err: ComfyUIApiError) -> Self {
        match err.transport_kind() {
            Some(kind) => OutpaintError::transport(kind, format!("ComfyUI: {err}")),
            None => match err {
                ComfyUIApiError::File { .. } => OutpaintError::Validation(err.to_string()),
                other => OutpaintError::Execution(other.to_string()),
            },
        }
    }
}

impl ComfyUIApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, api_url: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `GET /system_stats`: device and memory information.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// `GET /object_info`: every installed node class with its inputs.
    pub async fn object_info(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/object_info", self.api_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        let info: serde_json::Value = Self::parse_response(response).await?;
        if !info.is_object() {
            return Err(ComfyUIApiError::UnexpectedResponse(
                "/object_info did not return an object".into(),
            ));
        }
        Ok(info)
    }

    /// Upload a source image to the server's input folder.
    ///
    /// Returns the server-assigned name to reference from `LoadImage`.
    pub async fn upload_image(&self, path: &Path) -> Result<String, ComfyUIApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ComfyUIApiError::File {
                path: path.display().to_string(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());

        let form = reqwest::multipart::Form::new()
            .part(
                "image",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            )
            .text("type", "input")
            .text("overwrite", "true");

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;

        let body: UploadResponse = Self::parse_response(response).await?;
        body.name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ComfyUIApiError::UnexpectedResponse("upload returned no name".into()))
    }

    /// `POST /prompt` with the graph and client id.
    pub async fn submit_workflow(
        &self,
        workflow: &WorkflowGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /history/{prompt_id}`. The body is keyed by prompt id and is
    /// empty until the prompt has started executing.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// `GET /view`: raw bytes of one produced image.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", filename),
                ("subfolder", subfolder),
                ("type", folder_type),
            ])
            .timeout(VIEW_TIMEOUT)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_trimmed() {
        let api = ComfyUIApi::new("http://127.0.0.1:8188/");
        assert_eq!(api.api_url(), "http://127.0.0.1:8188");
    }

    #[test]
    fn api_status_errors_are_not_transient() {
        let err: OutpaintError = ComfyUIApiError::ApiError {
            status: 400,
            body: "invalid prompt".into(),
        }
        .into();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("invalid prompt"));
    }

    #[test]
    fn server_errors_are_transient_but_not_crashes() {
        let err: OutpaintError = ComfyUIApiError::ApiError {
            status: 502,
            body: "Bad Gateway".into(),
        }
        .into();
        assert!(err.is_transient());
        assert!(!err.is_backend_crash());
    }

    #[tokio::test]
    async fn refused_connection_is_crash_signature() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let api = ComfyUIApi::new(&format!("http://127.0.0.1:{port}"));
        let err: OutpaintError = api.system_stats().await.unwrap_err().into();
        assert!(err.is_backend_crash(), "{err:?}");
    }
}
