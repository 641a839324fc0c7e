//! [`BackendAdapter`] implementation for a local ComfyUI server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use outpaint_core::backend::{Availability, BackendAdapter, BackendRequest};
use outpaint_core::cancel::{ensure_active, run_or_cancel, sleep_or_cancel};
use outpaint_core::error::OutpaintError;
use outpaint_core::sink::{LogLevel, MessageSink};
use outpaint_core::types::BackendKind;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::catalog::CapabilityCatalog;
use crate::history::HistoryEntry;
use crate::inject::{inject, Injection};
use crate::readiness::{check_server_nodes, check_vram, loader_issues};
use crate::workflow::WorkflowGraph;

/// History polling cadence and budget.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 600,
        }
    }
}

/// Template and catalog fetched for one check/submit cycle.
struct Prepared {
    template: WorkflowGraph,
    catalog: CapabilityCatalog,
}

pub struct NodeGraphAdapter {
    api: ComfyUIApi,
    workflow_path: PathBuf,
    poll: PollSettings,
}

impl NodeGraphAdapter {
    pub fn new(base_url: &str, workflow_path: impl Into<PathBuf>) -> Self {
        Self {
            api: ComfyUIApi::new(base_url),
            workflow_path: workflow_path.into(),
            poll: PollSettings::default(),
        }
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn workflow_path(&self) -> &Path {
        &self.workflow_path
    }

    /// Readiness sequence, failing fast: status, VRAM, server nodes,
    /// template contract, loader assets.
    async fn prepare(&self) -> Result<Prepared, OutpaintError> {
        let stats = self.api.system_stats().await.map_err(|e| match e {
            ComfyUIApiError::ApiError { status, .. } => {
                OutpaintError::BackendUnavailable(format!("ComfyUI not responding: HTTP {status}"))
            }
            other => match other.transport_kind() {
                Some(kind) => OutpaintError::transport(kind, format!("ComfyUI not reachable: {other}")),
                None => OutpaintError::BackendUnavailable(format!("ComfyUI not responding: {other}")),
            },
        })?;
        check_vram(&stats).map_err(OutpaintError::BackendUnavailable)?;

        let info = self.api.object_info().await.map_err(|e| match e.transport_kind() {
            Some(kind) => OutpaintError::transport(kind, format!("ComfyUI /object_info error: {e}")),
            None => OutpaintError::BackendUnavailable(format!("ComfyUI /object_info error: {e}")),
        })?;
        let catalog = CapabilityCatalog::new(info);
        check_server_nodes(&catalog).map_err(OutpaintError::BackendUnavailable)?;

        let template = WorkflowGraph::load(&self.workflow_path)
            .and_then(|graph| graph.validate_required().map(|_| graph))
            .map_err(|e| OutpaintError::BackendUnavailable(format!("Workflow invalid: {e}")))?;

        let issues = loader_issues(&template, &catalog);
        if !issues.is_empty() {
            return Err(OutpaintError::BackendUnavailable(issues.join("\n")));
        }

        Ok(Prepared { template, catalog })
    }

    async fn poll_history(
        &self,
        prompt_id: &str,
        graph: &WorkflowGraph,
        progress: &dyn MessageSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, OutpaintError> {
        for attempt in 1..=self.poll.max_attempts {
            sleep_or_cancel(self.poll.interval, cancel).await?;

            let fetched = run_or_cancel(cancel, async {
                Ok::<_, OutpaintError>(self.api.get_history(prompt_id).await)
            })
            .await?;
            let body = match fetched {
                Ok(body) => body,
                Err(ComfyUIApiError::ApiError { status, .. }) => {
                    tracing::debug!(prompt_id, status, attempt, "History not available yet");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let Some(entry) = HistoryEntry::from_response(&body, prompt_id) else {
                continue;
            };

            if let Some(message) = entry.execution_error(graph) {
                tracing::warn!(prompt_id, error = %message, "ComfyUI execution failed");
                return Err(OutpaintError::Execution(message));
            }

            let images = entry.images();
            if images.is_empty() {
                if attempt % 10 == 0 {
                    progress.emit(
                        &format!("Waiting for ComfyUI... ({attempt}/{})", self.poll.max_attempts),
                        LogLevel::Progress,
                    );
                }
                continue;
            }

            progress.emit(
                &format!("Downloading {} image(s) from ComfyUI", images.len()),
                LogLevel::Download,
            );
            let mut results = Vec::with_capacity(images.len());
            for image in &images {
                ensure_active(cancel)?;
                let bytes = run_or_cancel(cancel, async {
                    self.api
                        .view(&image.filename, &image.subfolder, &image.folder_type)
                        .await
                        .map_err(OutpaintError::from)
                })
                .await?;
                results.push(bytes);
            }
            if !results.is_empty() {
                return Ok(results);
            }
        }

        Err(OutpaintError::Timeout(format!(
            "Timeout waiting for ComfyUI history after {} polls",
            self.poll.max_attempts
        )))
    }
}

#[async_trait]
impl BackendAdapter for NodeGraphAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::ComfyUi
    }

    async fn outpaint(
        &self,
        request: &BackendRequest,
        progress: &dyn MessageSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, OutpaintError> {
        ensure_active(cancel)?;
        let prepared = run_or_cancel(cancel, self.prepare()).await?;

        let file_name = request
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        progress.emit(&format!("Uploading to ComfyUI: {file_name}"), LogLevel::Upload);
        let uploaded = run_or_cancel(cancel, async {
            self.api
                .upload_image(&request.image_path)
                .await
                .map_err(OutpaintError::from)
        })
        .await?;

        let mut graph = prepared.template.clone();
        graph.validate_required()?;
        inject(
            &mut graph,
            &Injection {
                image_name: &uploaded,
                expand: request.expand,
                zoom_out_percentage: request.params.zoom_out_percentage,
                num_images: request.params.num_images,
                prompt: &request.params.prompt,
            },
            Some(&prepared.catalog),
        )?;
        graph.validate_required()?;

        let client_id = format!("outpaint-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        progress.emit("Submitting ComfyUI prompt...", LogLevel::Api);
        let submitted = run_or_cancel(cancel, async {
            self.api
                .submit_workflow(&graph, &client_id)
                .await
                .map_err(OutpaintError::from)
        })
        .await?;

        tracing::info!(
            prompt_id = %submitted.prompt_id,
            queue_position = ?submitted.number,
            image = %file_name,
            "ComfyUI prompt queued",
        );

        self.poll_history(&submitted.prompt_id, &graph, progress, cancel)
            .await
    }

    async fn check_available(&self) -> Availability {
        match self.prepare().await {
            Ok(_) => Availability::ready("ComfyUI ready"),
            Err(OutpaintError::Transport { message, .. })
            | Err(OutpaintError::BackendUnavailable(message)) => Availability::unavailable(message),
            Err(other) => Availability::unavailable(other.to_string()),
        }
    }
}
