use std::fmt;

use serde::{Deserialize, Serialize};

/// In-memory identifier of a queued job. Assigned sequentially per scheduler.
pub type JobId = u64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

// ---------------------------------------------------------------------------
// Backend kind
// ---------------------------------------------------------------------------

pub const BACKEND_COMFYUI: &str = "comfyui";
pub const BACKEND_FALAI: &str = "falai";

/// The two supported generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Locally hosted ComfyUI node-graph server.
    #[serde(rename = "comfyui")]
    ComfyUi,
    /// fal.ai managed queue service.
    #[serde(rename = "falai")]
    FalAi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComfyUi => BACKEND_COMFYUI,
            Self::FalAi => BACKEND_FALAI,
        }
    }

    /// Parse the configuration string form (`"comfyui"` / `"falai"`).
    pub fn from_str_value(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            BACKEND_COMFYUI => Ok(Self::ComfyUi),
            BACKEND_FALAI => Ok(Self::FalAi),
            other => Err(format!(
                "Unknown backend '{other}'. Must be one of: {BACKEND_COMFYUI}, {BACKEND_FALAI}"
            )),
        }
    }

    /// Human-facing name used in log lines.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::ComfyUi => "ComfyUI",
            Self::FalAi => "fal.ai",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Output format
// ---------------------------------------------------------------------------

/// Image format written to disk for every generated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    /// File extension, also the wire value sent to fal.ai.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }

    pub fn from_str_value(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::Webp),
            other => Err(format!(
                "Unsupported output format '{other}'. Must be one of: png, jpeg, webp"
            )),
        }
    }

    /// Whether the encoded file can carry an alpha channel.
    pub fn supports_alpha(&self) -> bool {
        !matches!(self, Self::Jpeg)
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
