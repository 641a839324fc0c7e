//! Persistent user configuration and the live config provider.
//!
//! The JSON file is read over defaults so older files missing newer keys
//! still load; unknown keys are ignored. Environment variables override
//! the file for the credential, server URL, workflow path and backend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::params::{
    validate_expand_percentage, validate_expand_pixels, validate_num_images, validate_zoom_out,
    ExpandPixels, Expansion, GenerationParameters,
};
use crate::types::{BackendKind, OutputFormat};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";
pub const DEFAULT_WORKFLOW_PATH: &str = "workflows/flux_outpaint.json";
pub const DEFAULT_OUTPUT_SUFFIX: &str = "-expanded";
pub const DEFAULT_FALAI_WORKERS: u32 = 5;
pub const DEFAULT_COMFYUI_WORKERS: u32 = 2;

pub const ENV_FAL_KEY: &str = "FAL_KEY";
pub const ENV_COMFYUI_URL: &str = "COMFYUI_URL";
pub const ENV_COMFYUI_WORKFLOW: &str = "COMFYUI_WORKFLOW";
pub const ENV_BACKEND: &str = "OUTPAINT_BACKEND";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpandMode {
    Pixels,
    #[default]
    Percentage,
}

/// What to do when an output target already exists and reprocessing is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReprocessMode {
    Overwrite,
    #[default]
    Increment,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Per-backend worker pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerLimits {
    pub falai: u32,
    pub comfyui: u32,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            falai: DEFAULT_FALAI_WORKERS,
            comfyui: DEFAULT_COMFYUI_WORKERS,
        }
    }
}

impl WorkerLimits {
    /// Pool size for `kind`, never below one.
    pub fn limit_for(&self, kind: BackendKind) -> usize {
        let raw = match kind {
            BackendKind::FalAi => self.falai,
            BackendKind::ComfyUi => self.comfyui,
        };
        raw.max(1) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutpaintConfig {
    pub backend: BackendKind,

    pub falai_api_key: String,
    pub enable_safety_checker: bool,

    pub comfyui_url: String,
    pub comfyui_workflow_path: String,

    /// Custom output folder; used only when `use_source_folder` is false.
    pub output_folder: String,
    pub use_source_folder: bool,
    pub output_suffix: String,
    pub output_format: OutputFormat,

    pub zoom_out_percentage: u32,
    pub expand_mode: ExpandMode,
    pub expand_percentage: u32,
    pub expand_left: u32,
    pub expand_right: u32,
    pub expand_top: u32,
    pub expand_bottom: u32,
    pub num_images: u32,
    pub prompt: String,

    pub workers: WorkerLimits,
    pub allow_reprocess: bool,
    pub reprocess_mode: ReprocessMode,
    pub verbose_logging: bool,
}

impl Default for OutpaintConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::FalAi,
            falai_api_key: String::new(),
            enable_safety_checker: true,
            comfyui_url: DEFAULT_COMFYUI_URL.to_string(),
            comfyui_workflow_path: DEFAULT_WORKFLOW_PATH.to_string(),
            output_folder: String::new(),
            use_source_folder: true,
            output_suffix: DEFAULT_OUTPUT_SUFFIX.to_string(),
            output_format: OutputFormat::Png,
            zoom_out_percentage: 30,
            expand_mode: ExpandMode::Percentage,
            expand_percentage: 30,
            expand_left: 0,
            expand_right: 0,
            expand_top: 0,
            expand_bottom: 0,
            num_images: 1,
            prompt: String::new(),
            workers: WorkerLimits::default(),
            allow_reprocess: true,
            reprocess_mode: ReprocessMode::Increment,
            verbose_logging: true,
        }
    }
}

impl OutpaintConfig {
    /// Load from a JSON file over defaults. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    /// Write as pretty JSON via a sibling temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Internal(format!("config serialization: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), CoreError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the environment source.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(ENV_FAL_KEY) {
            self.falai_api_key = key.trim().to_string();
        }
        if let Some(url) = non_empty(ENV_COMFYUI_URL) {
            self.comfyui_url = url.trim().to_string();
        }
        if let Some(path) = non_empty(ENV_COMFYUI_WORKFLOW) {
            self.comfyui_workflow_path = path.trim().to_string();
        }
        if let Some(backend) = non_empty(ENV_BACKEND) {
            self.backend = BackendKind::from_str_value(&backend).map_err(CoreError::Config)?;
        }
        Ok(())
    }

    pub fn has_fal_credential(&self) -> bool {
        !self.falai_api_key.trim().is_empty()
    }

    pub fn expand_pixels(&self) -> ExpandPixels {
        ExpandPixels::new(
            self.expand_left,
            self.expand_right,
            self.expand_top,
            self.expand_bottom,
        )
    }

    /// Snapshot the per-job generation parameters.
    pub fn generation_parameters(&self) -> GenerationParameters {
        let expansion = match self.expand_mode {
            ExpandMode::Percentage => Expansion::Percentage(self.expand_percentage),
            ExpandMode::Pixels => Expansion::Pixels(self.expand_pixels()),
        };
        GenerationParameters {
            zoom_out_percentage: self.zoom_out_percentage,
            expansion,
            num_images: self.num_images,
            prompt: self.prompt.clone(),
            output_format: self.output_format,
            enable_safety_checker: self.enable_safety_checker,
        }
    }

    /// Directory that receives outputs for `source`.
    pub fn output_dir_for(&self, source: &Path) -> PathBuf {
        let source_dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if self.use_source_folder || self.output_folder.trim().is_empty() {
            source_dir
        } else {
            PathBuf::from(self.output_folder.trim())
        }
    }

    /// Field range checks. Returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut push = |r: Result<(), CoreError>| {
            if let Err(CoreError::Validation(msg)) = r {
                errors.push(msg);
            }
        };
        push(validate_zoom_out(self.zoom_out_percentage));
        push(validate_expand_percentage(self.expand_percentage));
        push(validate_expand_pixels(&self.expand_pixels()));
        push(validate_num_images(self.num_images));
        push(validate_output_suffix(&self.output_suffix));
        if self.workers.falai == 0 || self.workers.comfyui == 0 {
            errors.push("workers limits must be at least 1".to_string());
        }
        errors
    }

    /// Field checks plus cross-field checks that touch the filesystem.
    pub fn collect_errors(&self) -> Vec<String> {
        let mut errors = self.validate();

        if self.backend == BackendKind::FalAi && !self.has_fal_credential() {
            errors.push("falai_api_key is required when backend is 'falai'".to_string());
        }

        if self.backend == BackendKind::ComfyUi {
            let path = Path::new(&self.comfyui_workflow_path);
            if !path.exists() {
                errors.push(format!(
                    "ComfyUI workflow not found: {}",
                    self.comfyui_workflow_path
                ));
            }
        }

        if !self.use_source_folder {
            if let Err(msg) = validate_output_folder(&self.output_folder) {
                errors.push(msg);
            }
        }

        errors
    }

    /// JSON view with the API key reduced to its first 8 characters.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            let masked = redact_key(&self.falai_api_key);
            obj.insert("falai_api_key".into(), serde_json::Value::String(masked));
        }
        value
    }
}

fn redact_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let prefix: String = key.chars().take(8).collect();
    format!("{prefix}...")
}

/// Suffix must be non-empty and must not escape the output directory.
pub fn validate_output_suffix(suffix: &str) -> Result<(), CoreError> {
    let suffix = suffix.trim();
    if suffix.is_empty() {
        return Err(CoreError::Validation(
            "output_suffix must not be empty".into(),
        ));
    }
    if suffix.contains('\0') {
        return Err(CoreError::Validation(
            "output_suffix contains invalid characters".into(),
        ));
    }
    if suffix.contains('/') || suffix.contains('\\') {
        return Err(CoreError::Validation(
            "output_suffix must not contain path separators".into(),
        ));
    }
    if suffix.contains(':') {
        return Err(CoreError::Validation(
            "output_suffix must not contain ':'".into(),
        ));
    }
    Ok(())
}

/// Create the folder if needed and prove it is writable.
pub fn validate_output_folder(folder: &str) -> Result<(), String> {
    let folder = folder.trim();
    if folder.is_empty() {
        return Ok(());
    }
    let path = Path::new(folder);
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| format!("Cannot create folder: {folder} ({e})"))?;
    }
    let probe = path.join(".write_test");
    std::fs::write(&probe, b"").map_err(|e| format!("Cannot write to folder: {folder} ({e})"))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Pull-based configuration source, re-read by the scheduler every tick.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> OutpaintConfig;
}

pub type SharedConfigProvider = Arc<dyn ConfigProvider>;

impl ConfigProvider for OutpaintConfig {
    fn current(&self) -> OutpaintConfig {
        self.clone()
    }
}

/// Config that can be swapped while jobs are running.
#[derive(Debug, Default)]
pub struct SharedConfig {
    inner: RwLock<OutpaintConfig>,
}

impl SharedConfig {
    pub fn new(config: OutpaintConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn replace(&self, config: OutpaintConfig) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = config;
    }

    /// Mutate in place under the write lock.
    pub fn update<F: FnOnce(&mut OutpaintConfig)>(&self, f: F) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}

impl ConfigProvider for SharedConfig {
    fn current(&self) -> OutpaintConfig {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // -- defaults and loading --

    #[test]
    fn defaults_validate_clean() {
        assert!(OutpaintConfig::default().validate().is_empty());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OutpaintConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg, OutpaintConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults_and_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"backend": "comfyui", "num_images": 3, "window_geometry": "800x600", "workers": {"comfyui": 4}}"#,
        )
        .unwrap();
        let cfg = OutpaintConfig::load(&path).unwrap();
        assert_eq!(cfg.backend, BackendKind::ComfyUi);
        assert_eq!(cfg.num_images, 3);
        assert_eq!(cfg.workers.comfyui, 4);
        assert_eq!(cfg.workers.falai, DEFAULT_FALAI_WORKERS);
        assert_eq!(cfg.output_suffix, DEFAULT_OUTPUT_SUFFIX);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(OutpaintConfig::load(&path), Err(CoreError::Config(_))));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let cfg = OutpaintConfig {
            prompt: "sunset beach".into(),
            reprocess_mode: ReprocessMode::Overwrite,
            ..Default::default()
        };
        cfg.save(&path).unwrap();
        assert_eq!(OutpaintConfig::load(&path).unwrap(), cfg);
        assert!(!path.with_extension("json.tmp").exists());
    }

    // -- environment --

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_FAL_KEY, "abc123"),
            (ENV_COMFYUI_URL, "http://gpu-box:8188"),
            (ENV_BACKEND, "comfyui"),
        ]);
        let mut cfg = OutpaintConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.falai_api_key, "abc123");
        assert_eq!(cfg.comfyui_url, "http://gpu-box:8188");
        assert_eq!(cfg.backend, BackendKind::ComfyUi);
        assert_eq!(cfg.comfyui_workflow_path, DEFAULT_WORKFLOW_PATH);
    }

    #[test]
    fn unknown_backend_in_env_is_rejected() {
        let mut cfg = OutpaintConfig::default();
        let result = cfg.apply_env_from(|k| (k == ENV_BACKEND).then(|| "midjourney".to_string()));
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    // -- validation --

    #[test]
    fn validate_reports_every_bad_field() {
        let cfg = OutpaintConfig {
            zoom_out_percentage: 95,
            num_images: 0,
            output_suffix: "a/b".into(),
            ..Default::default()
        };
        let errors = cfg.validate();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn suffix_rules() {
        assert!(validate_output_suffix("-expanded").is_ok());
        assert!(validate_output_suffix("  ").is_err());
        assert!(validate_output_suffix("a\\b").is_err());
        assert!(validate_output_suffix("c:d").is_err());
        assert!(validate_output_suffix("x\0").is_err());
    }

    #[test]
    fn falai_without_key_is_collected() {
        let cfg = OutpaintConfig::default();
        let errors = cfg.collect_errors();
        assert!(errors.iter().any(|e| e.contains("falai_api_key")));
    }

    #[test]
    fn comfyui_missing_workflow_is_collected() {
        let cfg = OutpaintConfig {
            backend: BackendKind::ComfyUi,
            comfyui_workflow_path: "/definitely/not/here.json".into(),
            ..Default::default()
        };
        let errors = cfg.collect_errors();
        assert!(errors.iter().any(|e| e.contains("workflow not found")));
    }

    #[test]
    fn custom_output_folder_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out").join("deep");
        let cfg = OutpaintConfig {
            falai_api_key: "k".into(),
            use_source_folder: false,
            output_folder: target.display().to_string(),
            ..Default::default()
        };
        assert!(cfg.collect_errors().is_empty());
        assert!(target.is_dir());
    }

    // -- derived values --

    #[test]
    fn output_dir_prefers_source_folder() {
        let cfg = OutpaintConfig {
            output_folder: "/tmp/custom".into(),
            ..Default::default()
        };
        assert_eq!(cfg.output_dir_for(Path::new("/pics/a.png")), PathBuf::from("/pics"));

        let custom = OutpaintConfig {
            use_source_folder: false,
            ..cfg
        };
        assert_eq!(
            custom.output_dir_for(Path::new("/pics/a.png")),
            PathBuf::from("/tmp/custom")
        );
    }

    #[test]
    fn worker_limit_never_zero() {
        let limits = WorkerLimits { falai: 0, comfyui: 3 };
        assert_eq!(limits.limit_for(BackendKind::FalAi), 1);
        assert_eq!(limits.limit_for(BackendKind::ComfyUi), 3);
    }

    #[test]
    fn redacted_masks_key() {
        let cfg = OutpaintConfig {
            falai_api_key: "0123456789abcdef".into(),
            ..Default::default()
        };
        let value = cfg.redacted();
        assert_eq!(value["falai_api_key"], "01234567...");
    }

    #[test]
    fn shared_config_updates_are_visible() {
        let shared = SharedConfig::new(OutpaintConfig::default());
        shared.update(|c| c.workers.comfyui = 7);
        assert_eq!(shared.current().workers.comfyui, 7);
    }

    #[test]
    fn pixel_mode_parameters() {
        let cfg = OutpaintConfig {
            expand_mode: ExpandMode::Pixels,
            expand_left: 5,
            expand_bottom: 9,
            ..Default::default()
        };
        let params = cfg.generation_parameters();
        assert_eq!(
            params.expansion,
            Expansion::Pixels(ExpandPixels::new(5, 0, 0, 9))
        );
    }
}
