//! Backend selection from validated configuration.

use outpaint_cloud::adapter::RemoteQueueAdapter;
use outpaint_comfyui::adapter::NodeGraphAdapter;
use outpaint_core::backend::SharedBackend;
use outpaint_core::config::OutpaintConfig;
use outpaint_core::error::CoreError;
use outpaint_core::types::BackendKind;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything needed to build one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    NodeGraph { base_url: String, workflow_path: PathBuf },
    RemoteQueue { api_key: String },
}

impl BackendSelection {
    pub fn from_config(config: &OutpaintConfig) -> Result<Self, CoreError> {
        match config.backend {
            BackendKind::ComfyUi => {
                let base_url = config.comfyui_url.trim();
                if base_url.is_empty() {
                    return Err(CoreError::Config("comfyui_url must not be empty".into()));
                }
                Ok(Self::NodeGraph {
                    base_url: base_url.to_string(),
                    workflow_path: PathBuf::from(&config.comfyui_workflow_path),
                })
            }
            BackendKind::FalAi => Self::remote(config).ok_or_else(|| {
                CoreError::Config("falai_api_key is required when backend is 'falai'".into())
            }),
        }
    }

    /// The remote queue selection, if a credential is configured.
    pub fn remote(config: &OutpaintConfig) -> Option<Self> {
        config.has_fal_credential().then(|| Self::RemoteQueue {
            api_key: config.falai_api_key.trim().to_string(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::NodeGraph { .. } => BackendKind::ComfyUi,
            Self::RemoteQueue { .. } => BackendKind::FalAi,
        }
    }

    pub fn build(&self) -> SharedBackend {
        match self {
            Self::NodeGraph {
                base_url,
                workflow_path,
            } => Arc::new(NodeGraphAdapter::new(base_url, workflow_path.clone())),
            Self::RemoteQueue { api_key } => Arc::new(RemoteQueueAdapter::new(api_key)),
        }
    }
}

/// Build the configured backend.
pub fn build_backend(config: &OutpaintConfig) -> Result<SharedBackend, CoreError> {
    Ok(BackendSelection::from_config(config)?.build())
}

/// Remote adapter used for automatic fallback from the node-graph backend.
/// `None` when the active backend is already remote or no key is set.
pub fn build_remote_fallback(config: &OutpaintConfig) -> Option<SharedBackend> {
    if config.backend != BackendKind::ComfyUi {
        return None;
    }
    BackendSelection::remote(config).map(|s| s.build())
}
