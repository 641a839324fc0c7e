//! Single-image outpaint over multipart upload.
//!
//! Every request gets its own scratch directory under the server work dir
//! and its own orchestrator built from the base settings plus the form
//! overrides. Fallback state is never shared between requests.

use std::path::{Path, PathBuf};

use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use image::ImageFormat;
use outpaint_core::config::{ConfigProvider, ExpandMode, OutpaintConfig};
use outpaint_core::error::CoreError;
use outpaint_core::params::ExpandPixels;
use outpaint_core::types::{BackendKind, OutputFormat};
use outpaint_pipeline::generator::GenerateOutcome;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Pixel expansion applied to each side when the form leaves it out.
pub const DEFAULT_EXPAND_PX: u32 = 200;

// ---------------------------------------------------------------------------
// Form
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Upload {
    content_type: Option<String>,
    bytes: Bytes,
}

/// Parsed multipart fields. Unset fields keep the request defaults, which
/// differ from the saved settings: pixel mode at 200px per side, no zoom.
#[derive(Debug)]
struct OutpaintForm {
    image: Option<Upload>,
    zoom_out_percentage: u32,
    expand_percentage: Option<u32>,
    expand: ExpandPixels,
    num_images: u32,
    prompt: String,
    output_format: OutputFormat,
    return_file: bool,
}

impl Default for OutpaintForm {
    fn default() -> Self {
        Self {
            image: None,
            zoom_out_percentage: 0,
            expand_percentage: None,
            expand: ExpandPixels::new(
                DEFAULT_EXPAND_PX,
                DEFAULT_EXPAND_PX,
                DEFAULT_EXPAND_PX,
                DEFAULT_EXPAND_PX,
            ),
            num_images: 1,
            prompt: String::new(),
            output_format: OutputFormat::Png,
            return_file: true,
        }
    }
}

impl OutpaintForm {
    async fn from_multipart(mut multipart: Multipart) -> AppResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "image" {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {e}")))?;
                form.image = Some(Upload {
                    content_type,
                    bytes,
                });
                continue;
            }
            let value = field
                .text()
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read field {name}: {e}")))?;
            form.set(&name, value.trim())?;
        }
        Ok(form)
    }

    fn set(&mut self, name: &str, value: &str) -> AppResult<()> {
        if value.is_empty() {
            return Ok(());
        }
        match name {
            "zoom_out_percentage" => self.zoom_out_percentage = parse_number(name, value)?,
            "expand_percentage" => self.expand_percentage = Some(parse_number(name, value)?),
            "expand_left" => self.expand.left = parse_number(name, value)?,
            "expand_right" => self.expand.right = parse_number(name, value)?,
            "expand_top" => self.expand.top = parse_number(name, value)?,
            "expand_bottom" => self.expand.bottom = parse_number(name, value)?,
            "num_images" => self.num_images = parse_number(name, value)?,
            "prompt" => self.prompt = value.to_string(),
            "output_format" => {
                self.output_format =
                    OutputFormat::from_str_value(value).map_err(AppError::BadRequest)?
            }
            "return_file" => self.return_file = parse_bool(name, value)?,
            other => tracing::debug!(field = other, "Ignoring unknown form field"),
        }
        Ok(())
    }

    /// Overlay the request parameters on the base settings.
    fn apply(&self, config: &mut OutpaintConfig) {
        config.zoom_out_percentage = self.zoom_out_percentage;
        match self.expand_percentage {
            Some(pct) => {
                config.expand_mode = ExpandMode::Percentage;
                config.expand_percentage = pct;
            }
            None => {
                config.expand_mode = ExpandMode::Pixels;
                config.expand_left = self.expand.left;
                config.expand_right = self.expand.right;
                config.expand_top = self.expand.top;
                config.expand_bottom = self.expand.bottom;
            }
        }
        config.num_images = self.num_images;
        config.prompt = self.prompt.clone();
        config.output_format = self.output_format;
    }
}

fn parse_number(name: &str, value: &str) -> AppResult<u32> {
    value.parse().map_err(|_| {
        AppError::BadRequest(format!(
            "{name} must be a non-negative integer, got '{value}'"
        ))
    })
}

fn parse_bool(name: &str, value: &str) -> AppResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AppError::BadRequest(format!(
            "{name} must be true or false, got '{value}'"
        ))),
    }
}

/// File extension for the stored upload, sniffed from the bytes.
fn upload_extension(upload: &Upload) -> AppResult<&'static str> {
    let declared_image = upload
        .content_type
        .as_deref()
        .map_or(true, |ct| ct.starts_with("image/"));
    let invalid = || AppError::BadRequest("Invalid image file".into());
    if !declared_image {
        return Err(invalid());
    }
    match image::guess_format(&upload.bytes) {
        Ok(ImageFormat::Png) => Ok("png"),
        Ok(ImageFormat::Jpeg) => Ok("jpg"),
        Ok(ImageFormat::WebP) => Ok("webp"),
        Ok(ImageFormat::Bmp) => Ok("bmp"),
        Ok(ImageFormat::Tiff) => Ok("tiff"),
        _ => Err(invalid()),
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct OutpaintResponse {
    pub success: bool,
    pub backend_used: BackendKind,
    pub fallback_triggered: bool,
    pub output_path: String,
    pub num_outputs: usize,
    pub message: &'static str,
}

struct JobOutput {
    request_id: String,
    output_path: PathBuf,
    num_outputs: usize,
    backend_used: BackendKind,
    fallback_triggered: bool,
    format: OutputFormat,
}

/// POST /outpaint
///
/// Returns the first output image by default. With `return_file=false`
/// the outputs stay on disk and the response describes them instead.
async fn outpaint(State(state): State<AppState>, multipart: Multipart) -> AppResult<Response> {
    let form = OutpaintForm::from_multipart(multipart).await?;
    let upload = form
        .image
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("Missing image file".into()))?;
    let extension = upload_extension(upload)?;

    let mut config = state.outpaint.current();
    form.apply(&mut config);
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(CoreError::Validation(errors.join("; ")).into());
    }

    let request_id = Uuid::new_v4().simple().to_string();
    let work_dir = state.config.work_dir.join(format!("job_{request_id}"));
    tokio::fs::create_dir_all(&work_dir)
        .await
        .map_err(CoreError::from)?;

    config.output_folder = work_dir.to_string_lossy().into_owned();
    config.use_source_folder = false;
    config.allow_reprocess = true;

    let result = run_job(&state, config, &work_dir, &upload.bytes, extension, request_id).await;

    let response = match result {
        // Outputs stay on disk for the caller to collect.
        Ok(job) if !form.return_file => {
            return Ok(Json(OutpaintResponse {
                success: true,
                backend_used: job.backend_used,
                fallback_triggered: job.fallback_triggered,
                output_path: job.output_path.display().to_string(),
                num_outputs: job.num_outputs,
                message: "Outpaint completed successfully",
            })
            .into_response());
        }
        Ok(job) => file_response(&job).await,
        Err(err) => Err(err),
    };
    discard(&work_dir).await;
    response
}

async fn run_job(
    state: &AppState,
    config: OutpaintConfig,
    work_dir: &Path,
    bytes: &[u8],
    extension: &str,
    request_id: String,
) -> AppResult<JobOutput> {
    let input = work_dir.join(format!("input.{extension}"));
    tokio::fs::write(&input, bytes)
        .await
        .map_err(CoreError::from)?;

    let format = config.output_format;
    let orchestrator = state.orchestrators.build(config)?;

    // Dropping the handler (client went away) cancels the job.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = match orchestrator.generate(&input, &cancel).await? {
        GenerateOutcome::Completed(result) => result,
        GenerateOutcome::Skipped { reason, .. } => {
            return Err(AppError::InternalError(format!(
                "Job skipped unexpectedly: {reason}"
            )));
        }
    };
    let output_path = result
        .output_paths
        .first()
        .cloned()
        .ok_or_else(|| AppError::InternalError("Backend returned no outputs".into()))?;

    tracing::info!(
        request_id = %request_id,
        backend = %result.backend_used,
        outputs = result.output_paths.len(),
        "Outpaint request completed"
    );

    Ok(JobOutput {
        request_id,
        output_path,
        num_outputs: result.output_paths.len(),
        backend_used: result.backend_used,
        fallback_triggered: orchestrator.fallback_triggered(),
        format,
    })
}

async fn file_response(job: &JobOutput) -> AppResult<Response> {
    let bytes = tokio::fs::read(&job.output_path)
        .await
        .map_err(CoreError::from)?;
    let filename = format!(
        "outpaint_{}.{}",
        &job.request_id[..8],
        job.format.extension()
    );
    let headers = [
        (header::CONTENT_TYPE, job.format.mime_type().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, bytes).into_response())
}

async fn discard(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove request directory");
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/outpaint", post(outpaint))
}
