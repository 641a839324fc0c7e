//! Queue lifecycle events fanned out over a `tokio::sync::broadcast`
//! channel.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use outpaint_core::job::JobStatus;
use outpaint_core::types::{BackendKind, JobId};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEventKind {
    Added {
        job_id: JobId,
        path: PathBuf,
    },
    StatusChanged {
        job_id: JobId,
        path: PathBuf,
        status: JobStatus,
        error: Option<String>,
        outputs: Vec<PathBuf>,
    },
    /// A replacement orchestrator was installed after repeated failures.
    BackendSwitched {
        backend: BackendKind,
    },
    Paused,
    Resumed,
    StopRequested,
    /// Idle records were dropped from the queue.
    Cleared {
        removed: usize,
    },
    /// The run loop exited.
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEvent {
    #[serde(flatten)]
    pub kind: QueueEventKind,
    pub timestamp: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(kind: QueueEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }
}

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out hub for [`QueueEvent`]s. Slow receivers observe
/// `RecvError::Lagged` rather than blocking the scheduler.
pub struct QueueEvents {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, kind: QueueEventKind) {
        // Zero receivers is fine.
        let _ = self.sender.send(QueueEvent::new(kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
