//! Per-image job orchestration.
//!
//! A [`JobOrchestrator`] owns one configuration snapshot and the active
//! backend adapter. [`JobOrchestrator::generate`] runs one image through
//! validation, the backend (with bounded retry and a one-shot switch to
//! the remote queue when the node-graph server is gone), and output
//! placement.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use outpaint_core::backend::{Availability, BackendRequest, SharedBackend};
use outpaint_core::cancel::{ensure_active, sleep_or_cancel};
use outpaint_core::config::OutpaintConfig;
use outpaint_core::error::OutpaintError;
use outpaint_core::naming::expected_targets;
use outpaint_core::sink::{LogLevel, SharedSink, TracingSink};
use outpaint_core::types::BackendKind;
use outpaint_core::validation::{check_output_size, validate_input_image};
use tokio_util::sync::CancellationToken;

use crate::backends::{build_backend, build_remote_fallback};
use crate::output::{write_outputs, Placement};
use crate::retry::RetryPolicy;

/// Reason reported when every target already exists.
pub const SKIPPED_EXISTING: &str = "Outputs already exist";

/// A successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutpaintResult {
    pub source_path: PathBuf,
    pub output_paths: Vec<PathBuf>,
    /// Backend that produced the images; differs from the configured one
    /// after an automatic fallback.
    pub backend_used: BackendKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    Completed(OutpaintResult),
    /// Nothing was generated. `output_paths` lists files already on disk.
    Skipped {
        reason: String,
        output_paths: Vec<PathBuf>,
    },
}

impl GenerateOutcome {
    pub fn output_paths(&self) -> &[PathBuf] {
        match self {
            Self::Completed(result) => &result.output_paths,
            Self::Skipped { output_paths, .. } => output_paths,
        }
    }
}

pub struct JobOrchestrator {
    config: OutpaintConfig,
    active: RwLock<SharedBackend>,
    fallback: Option<SharedBackend>,
    /// Set once the active adapter has been swapped for `fallback`.
    fallback_attempted: Mutex<bool>,
    retry: RetryPolicy,
    progress: SharedSink,
}

impl JobOrchestrator {
    /// Build adapters from `config`. Fails when the selected backend is
    /// not constructible (for example remote queue without a key).
    pub fn new(config: OutpaintConfig) -> Result<Self, OutpaintError> {
        let active = build_backend(&config)?;
        let fallback = build_remote_fallback(&config);
        Ok(Self::with_backends(config, active, fallback))
    }

    pub fn with_backends(
        config: OutpaintConfig,
        active: SharedBackend,
        fallback: Option<SharedBackend>,
    ) -> Self {
        Self {
            config,
            active: RwLock::new(active),
            fallback,
            fallback_attempted: Mutex::new(false),
            retry: RetryPolicy::default(),
            progress: Arc::new(TracingSink),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route backend progress and orchestration warnings to `sink`.
    pub fn with_progress(mut self, sink: SharedSink) -> Self {
        self.progress = sink;
        self
    }

    pub fn config(&self) -> &OutpaintConfig {
        &self.config
    }

    pub fn active_kind(&self) -> BackendKind {
        self.current_backend().kind()
    }

    pub fn fallback_available(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn fallback_triggered(&self) -> bool {
        *self
            .fallback_attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn check_backend_available(&self) -> Availability {
        self.current_backend().check_available().await
    }

    fn current_backend(&self) -> SharedBackend {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Outpaint one image and place its outputs.
    pub async fn generate(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<GenerateOutcome, OutpaintError> {
        ensure_active(cancel)?;

        let (width, height) = validate_input_image(source)?;
        let params = self.config.generation_parameters();
        params.validate()?;
        let expand = params.expansion.resolve(width, height);

        let size = check_output_size(width, height, params.zoom_out_percentage, &expand)?;
        if let Some(warning) = &size.warning {
            self.progress.emit(warning, LogLevel::Warning);
        }

        let out_dir = self.config.output_dir_for(source);
        std::fs::create_dir_all(&out_dir).map_err(|e| {
            OutpaintError::Output(format!("Cannot create {}: {e}", out_dir.display()))
        })?;

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let targets = expected_targets(
            &out_dir,
            &stem,
            &self.config.output_suffix,
            params.num_images,
            params.output_format,
        );

        if !self.config.allow_reprocess && targets.iter().all(|t| t.exists()) {
            tracing::info!(source = %source.display(), "Outputs already exist, skipping");
            return Ok(GenerateOutcome::Skipped {
                reason: SKIPPED_EXISTING.to_string(),
                output_paths: targets,
            });
        }

        let request = BackendRequest {
            image_path: source.to_path_buf(),
            params,
            expand,
        };
        let (payloads, backend_used) = self.outpaint_with_retry(&request, cancel).await?;
        ensure_active(cancel)?;

        let format = request.params.output_format;
        let placement = Placement::from_config(&self.config);
        let output_paths = tokio::task::spawn_blocking(move || {
            write_outputs(&payloads, &targets, format, placement)
        })
        .await
        .map_err(|e| OutpaintError::Output(format!("Output writer panicked: {e}")))??;

        tracing::info!(
            source = %source.display(),
            backend = %backend_used,
            outputs = output_paths.len(),
            "Outpaint completed"
        );
        Ok(GenerateOutcome::Completed(OutpaintResult {
            source_path: source.to_path_buf(),
            output_paths,
            backend_used,
        }))
    }

    /// Call the active backend with bounded retry on transient failures.
    ///
    /// A node-graph crash swaps in the remote adapter (once per
    /// orchestrator) and retries immediately without consuming an attempt.
    async fn outpaint_with_retry(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Vec<u8>>, BackendKind), OutpaintError> {
        let delays = self.retry.delays();
        let mut attempt: usize = 0;

        loop {
            ensure_active(cancel)?;
            if attempt > 0 {
                let delay = delays[attempt - 1];
                self.progress.emit(
                    &format!("Retrying in {}s...", delay.as_secs()),
                    LogLevel::Warning,
                );
                sleep_or_cancel(delay, cancel).await?;
            }
            attempt += 1;

            let backend = self.current_backend();
            let err = match backend.outpaint(request, self.progress.as_ref(), cancel).await {
                Ok(payloads) => return Ok((payloads, backend.kind())),
                Err(e) => e,
            };
            if err.is_cancelled() {
                return Err(err);
            }

            let err = if err.is_backend_crash() && backend.kind() == BackendKind::ComfyUi {
                match self.switch_to_fallback(&err)? {
                    Some(remote) => {
                        match remote.outpaint(request, self.progress.as_ref(), cancel).await {
                            Ok(payloads) => return Ok((payloads, remote.kind())),
                            Err(e) => {
                                self.progress.emit(
                                    &format!("Fallback backend also failed: {e}"),
                                    LogLevel::Error,
                                );
                                e
                            }
                        }
                    }
                    None => err,
                }
            } else {
                err
            };

            if !err.is_transient() || attempt >= delays.len() + 1 {
                return Err(err);
            }
            tracing::warn!(attempt, error = %err, "Transient backend failure");
        }
    }

    /// Swap the active adapter for the remote one. Returns the adapter to
    /// retry with, or `None` when there is nothing new to try.
    fn switch_to_fallback(
        &self,
        cause: &OutpaintError,
    ) -> Result<Option<SharedBackend>, OutpaintError> {
        let Some(remote) = &self.fallback else {
            let message = "ComfyUI failed and no fal.ai API key configured. Cannot auto-fallback.";
            self.progress.emit(message, LogLevel::Error);
            return Err(OutpaintError::BackendUnavailable(format!("{message} ({cause})")));
        };

        let mut attempted = self
            .fallback_attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *attempted {
            let current = self.current_backend();
            return Ok((current.kind() != BackendKind::ComfyUi).then_some(current));
        }
        *attempted = true;
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(remote);
        drop(attempted);

        self.progress.emit(
            "ComfyUI backend failed. Auto-switching to fal.ai backend...",
            LogLevel::Warning,
        );
        tracing::warn!(error = %cause, "Node-graph backend crashed, switched to remote queue");
        Ok(Some(Arc::clone(remote)))
    }
}
