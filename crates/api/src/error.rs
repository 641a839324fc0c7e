use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use outpaint_core::error::{CoreError, OutpaintError};
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps the domain errors and adds HTTP-specific variants. Every variant
/// renders as `{"error": ..., "code": ...}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A failed outpaint job.
    #[error(transparent)]
    Outpaint(#[from] OutpaintError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Config(msg) => {
                    tracing::error!(error = %msg, "Configuration error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "CONFIG_ERROR",
                        format!("Configuration error: {msg}"),
                    )
                }
                CoreError::Io(err) => {
                    tracing::error!(error = %err, "I/O error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            // --- Job failures ---
            AppError::Outpaint(err) => classify_outpaint_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Map a job failure to an HTTP status, error code, and message.
///
/// Backend-side failures surface as gateway errors so callers can tell
/// them apart from their own bad input.
fn classify_outpaint_error(err: &OutpaintError) -> (StatusCode, &'static str, String) {
    let message = format!("Outpaint failed: {err}");
    match err {
        OutpaintError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message),
        OutpaintError::BackendUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "BACKEND_UNAVAILABLE",
            message,
        ),
        OutpaintError::PaymentRequired(_) => {
            (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED", message)
        }
        OutpaintError::Transport { .. } | OutpaintError::Execution(_) => {
            tracing::warn!(error = %err, "Backend failed");
            (StatusCode::BAD_GATEWAY, "BACKEND_ERROR", message)
        }
        OutpaintError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "BACKEND_TIMEOUT", message),
        OutpaintError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED", message),
        OutpaintError::Output(_) => {
            tracing::error!(error = %err, "Writing outputs failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "OUTPUT_ERROR", message)
        }
    }
}
