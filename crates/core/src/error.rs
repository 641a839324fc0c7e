use std::fmt;

/// Errors raised by pure domain logic: parameter and configuration checks.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Job-level taxonomy
// ---------------------------------------------------------------------------

/// How a transport failure happened.
///
/// `Connect` is the node-graph crash signature: the local server refused
/// or dropped the connection, which makes the job eligible for fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Connect,
    Timeout,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Other => "other",
        })
    }
}

/// Outcome classification for a single outpaint job.
///
/// Adapters raise these; the orchestrator decides retry and fallback from
/// the variant alone. Only [`OutpaintError::Transport`] is retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutpaintError {
    /// Bad input or parameters. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Backend not ready or misconfigured (missing models, no credential).
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Network-level failure talking to a backend.
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    /// The backend ran the job and reported a failure.
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Cancelled")]
    Cancelled,

    /// Poll budget exhausted.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Decoding or writing an output image failed.
    #[error("Output error: {0}")]
    Output(String),
}

impl OutpaintError {
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Transport errors (including request timeouts) are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// The local server could not be reached at all.
    pub fn is_backend_crash(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportKind::Connect,
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The backend itself misbehaved, as opposed to the job's inputs,
    /// the local disk, billing or a stop request.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_)
                | Self::Transport { .. }
                | Self::Execution(_)
                | Self::Timeout(_)
        )
    }
}

impl From<CoreError> for OutpaintError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) | CoreError::Config(msg) => Self::Validation(msg),
            CoreError::Io(e) => Self::Output(e.to_string()),
            CoreError::Internal(msg) => Self::Execution(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(OutpaintError::transport(TransportKind::Timeout, "read timed out").is_transient());
        assert!(OutpaintError::transport(TransportKind::Other, "reset").is_transient());
        assert!(!OutpaintError::Timeout("600 polls".into()).is_transient());
        assert!(!OutpaintError::Execution("oom".into()).is_transient());
        assert!(!OutpaintError::PaymentRequired("balance".into()).is_transient());
        assert!(!OutpaintError::Cancelled.is_transient());
    }

    #[test]
    fn crash_signature_is_connect_failure() {
        assert!(OutpaintError::transport(TransportKind::Connect, "refused").is_backend_crash());
        assert!(!OutpaintError::transport(TransportKind::Timeout, "slow").is_backend_crash());
        assert!(!OutpaintError::BackendUnavailable("down".into()).is_backend_crash());
    }

    #[test]
    fn backend_faults_exclude_input_and_output_problems() {
        assert!(OutpaintError::BackendUnavailable("no models".into()).is_backend_fault());
        assert!(OutpaintError::transport(TransportKind::Connect, "refused").is_backend_fault());
        assert!(OutpaintError::Execution("oom".into()).is_backend_fault());
        assert!(OutpaintError::Timeout("600 polls".into()).is_backend_fault());
        assert!(!OutpaintError::Validation("too small".into()).is_backend_fault());
        assert!(!OutpaintError::Output("disk full".into()).is_backend_fault());
        assert!(!OutpaintError::PaymentRequired("balance".into()).is_backend_fault());
        assert!(!OutpaintError::Cancelled.is_backend_fault());
    }

    #[test]
    fn core_validation_maps_to_job_validation() {
        let err: OutpaintError = CoreError::Validation("zoom too large".into()).into();
        assert!(matches!(err, OutpaintError::Validation(m) if m == "zoom too large"));
    }

    #[test]
    fn transport_display_names_kind() {
        let err = OutpaintError::transport(TransportKind::Connect, "connection refused");
        assert_eq!(err.to_string(), "Transport error (connect): connection refused");
    }
}
