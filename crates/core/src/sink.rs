//! Fire-and-forget message sinks for log lines and backend progress.

use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
    /// Backend stage markers.
    Upload,
    Api,
    Task,
    Download,
    Resize,
    Progress,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Upload => "upload",
            Self::Api => "api",
            Self::Task => "task",
            Self::Download => "download",
            Self::Resize => "resize",
            Self::Progress => "progress",
        }
    }
}

/// Receives `(message, level)` pairs. Implementations must not block.
pub trait MessageSink: Send + Sync {
    fn emit(&self, message: &str, level: LogLevel);
}

pub type SharedSink = Arc<dyn MessageSink>;

impl<F> MessageSink for F
where
    F: Fn(&str, LogLevel) + Send + Sync,
{
    fn emit(&self, message: &str, level: LogLevel) {
        self(message, level)
    }
}

/// Forwards every message to `tracing` at the closest level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn emit(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Debug => tracing::debug!(level = level.as_str(), "{message}"),
            LogLevel::Warning => tracing::warn!(level = level.as_str(), "{message}"),
            LogLevel::Error => tracing::error!(level = level.as_str(), "{message}"),
            _ => tracing::info!(level = level.as_str(), "{message}"),
        }
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MessageSink for NullSink {
    fn emit(&self, _message: &str, _level: LogLevel) {}
}
