//! [`BackendAdapter`] implementation for the fal.ai outpaint queue.

use async_trait::async_trait;
use outpaint_core::backend::{Availability, BackendAdapter, BackendRequest};
use outpaint_core::cancel::{ensure_active, run_or_cancel, sleep_or_cancel};
use outpaint_core::error::OutpaintError;
use outpaint_core::sink::{LogLevel, MessageSink};
use outpaint_core::types::BackendKind;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::hosting::{prepare_upload, FreeImageHost};
use crate::poll::PollSchedule;
use crate::queue::{
    locate_outputs, urls_from_response_body, FalApiError, FalQueueClient, OutpaintPayload,
    OutputLocation, QueueStatus,
};

pub struct RemoteQueueAdapter {
    queue: FalQueueClient,
    host: FreeImageHost,
    schedule: PollSchedule,
}

impl RemoteQueueAdapter {
    /// Production endpoints with the given API key.
    pub fn new(api_key: &str) -> Self {
        Self::with_clients(FalQueueClient::new(api_key), FreeImageHost::from_env())
    }

    pub fn with_clients(queue: FalQueueClient, host: FreeImageHost) -> Self {
        Self {
            queue,
            host,
            schedule: PollSchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    async fn stage_image(
        &self,
        request: &BackendRequest,
        progress: &dyn MessageSink,
        cancel: &CancellationToken,
    ) -> Result<String, OutpaintError> {
        let path = request.image_path.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare_upload(&path))
            .await
            .map_err(|e| OutpaintError::Output(format!("image preparation panicked: {e}")))??;

        if let Some((w, h)) = prepared.resized_from {
            progress.emit(
                &format!("Image too large ({w}x{h}), resized to fit 4096px"),
                LogLevel::Resize,
            );
        }

        let name = request
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        progress.emit(&format!("Uploading {name}..."), LogLevel::Upload);
        let url = run_or_cancel(cancel, async {
            self.host
                .upload(&prepared.jpeg)
                .await
                .map_err(OutpaintError::from)
        })
        .await?;
        progress.emit(&format!("Uploaded: {url}"), LogLevel::Upload);
        Ok(url)
    }

    fn payload(request: &BackendRequest, image_url: String) -> OutpaintPayload {
        OutpaintPayload {
            image_url,
            zoom_out_percentage: request.params.zoom_out_percentage,
            expand_left: request.expand.left,
            expand_right: request.expand.right,
            expand_top: request.expand.top,
            expand_bottom: request.expand.bottom,
            num_images: request.params.num_images,
            prompt: request.params.prompt.clone(),
            enable_safety_checker: request.params.enable_safety_checker,
            output_format: request.params.output_format.extension().to_string(),
        }
    }

    /// Poll until a terminal status. Returns the completed status body.
    async fn wait_for_completion(
        &self,
        status_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, OutpaintError> {
        let mut attempt = 0;
        while attempt < self.schedule.max_attempts {
            ensure_active(cancel)?;
            sleep_or_cancel(self.schedule.delay_for(attempt), cancel).await?;
            attempt += 1;

            let fetched = run_or_cancel(cancel, async {
                Ok::<_, OutpaintError>(self.queue.status(status_url).await)
            })
            .await?;
            let body = match fetched {
                Ok(body) => body,
                Err(FalApiError::RateLimited) => {
                    tracing::debug!(attempt, "fal.ai rate limited, backing off");
                    sleep_or_cancel(self.schedule.rate_limit_backoff, cancel).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let raw_status = body.get("status").and_then(Value::as_str).unwrap_or_default();
            match QueueStatus::parse(raw_status) {
                QueueStatus::InQueue | QueueStatus::InProgress => continue,
                QueueStatus::Completed => return Ok(body),
                status if status.is_failure() => {
                    let message = body
                        .get("error")
                        .and_then(Value::as_str)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Job {raw_status}"));
                    return Err(OutpaintError::Execution(message));
                }
                _ => {
                    tracing::debug!(status = raw_status, attempt, "Unrecognised fal.ai status");
                    continue;
                }
            }
        }

        Err(OutpaintError::Timeout(format!(
            "Timeout waiting for fal.ai outpaint job after {} polls",
            self.schedule.max_attempts
        )))
    }

    async fn output_urls(&self, body: &Value, cancel: &CancellationToken) -> Result<Vec<String>, OutpaintError> {
        let urls = match locate_outputs(body) {
            OutputLocation::Urls(urls) => urls,
            OutputLocation::ResponseUrl(url) => {
                let result = run_or_cancel(cancel, async {
                    self.queue.result(&url).await.map_err(OutpaintError::from)
                })
                .await?;
                urls_from_response_body(&result)
            }
            OutputLocation::Missing => Vec::new(),
        };
        if urls.is_empty() {
            return Err(OutpaintError::Execution(format!("No images in response: {body}")));
        }
        Ok(urls)
    }
}

#[async_trait]
impl BackendAdapter for RemoteQueueAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::FalAi
    }

    async fn outpaint(
        &self,
        request: &BackendRequest,
        progress: &dyn MessageSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, OutpaintError> {
        ensure_active(cancel)?;
        if !self.queue.has_key() {
            return Err(OutpaintError::BackendUnavailable(
                "fal.ai API key not configured".into(),
            ));
        }

        let image_url = self.stage_image(request, progress, cancel).await?;
        let payload = Self::payload(request, image_url);

        progress.emit("Submitting outpaint job...", LogLevel::Api);
        let receipt = run_or_cancel(cancel, async {
            self.queue.submit(&payload).await.map_err(OutpaintError::from)
        })
        .await?;
        progress.emit(&format!("Task created: {}", receipt.request_id), LogLevel::Task);
        tracing::info!(request_id = %receipt.request_id, "fal.ai job queued");

        let body = self.wait_for_completion(&receipt.status_url, cancel).await?;
        let urls = self.output_urls(&body, cancel).await?;

        let mut results = Vec::with_capacity(urls.len());
        for url in &urls {
            ensure_active(cancel)?;
            progress.emit(&format!("Downloading {url}"), LogLevel::Download);
            let downloaded = run_or_cancel(cancel, async {
                Ok::<_, OutpaintError>(self.queue.download(url).await)
            })
            .await?;
            match downloaded {
                Ok(bytes) => results.push(bytes),
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Result download failed");
                    progress.emit(&format!("Download failed: {url} ({e})"), LogLevel::Warning);
                }
            }
        }

        if results.is_empty() {
            return Err(OutpaintError::Execution(
                "No downloadable images returned".into(),
            ));
        }
        Ok(results)
    }

    async fn check_available(&self) -> Availability {
        if self.queue.has_key() {
            Availability::ready("fal.ai API key configured")
        } else {
            Availability::unavailable("fal.ai API key not configured")
        }
    }
}
