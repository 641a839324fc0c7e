//! The contract every generation backend implements.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::OutpaintError;
use crate::params::{ExpandPixels, GenerationParameters};
use crate::sink::MessageSink;
use crate::types::BackendKind;

/// A fully resolved request handed to an adapter.
///
/// Expansion has already been converted to pixels from the source
/// dimensions, so adapters never see percentages.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub image_path: PathBuf,
    pub params: GenerationParameters,
    pub expand: ExpandPixels,
}

/// Result of a readiness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub ready: bool,
    pub message: String,
}

impl Availability {
    pub fn ready(message: impl Into<String>) -> Self {
        Self {
            ready: true,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Produce `request.params.num_images` encoded images or fail.
    ///
    /// Must check `cancel` at every wait point and return
    /// [`OutpaintError::Cancelled`] promptly once it fires.
    async fn outpaint(
        &self,
        request: &BackendRequest,
        progress: &dyn MessageSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, OutpaintError>;

    /// Side-effect-free readiness probe. Never submits a job.
    async fn check_available(&self) -> Availability;
}

pub type SharedBackend = Arc<dyn BackendAdapter>;
