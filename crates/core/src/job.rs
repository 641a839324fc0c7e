//! Queue job records and their status state machine.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Error text recorded when a stop request interrupts a job.
pub const STOPPED_MESSAGE: &str = "Stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Forward transitions plus the explicit retry edge back to pending.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Skipped)
                | (Processing, Failed)
                | (Failed, Pending)
                | (Skipped, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued source image.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub source_path: PathBuf,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub output_paths: Vec<PathBuf>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl JobRecord {
    pub fn new(id: JobId, source_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            source_path: source_path.into(),
            status: JobStatus::Pending,
            error_message: None,
            output_paths: Vec::new(),
            created_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn filename(&self) -> String {
        file_name_lossy(&self.source_path)
    }

    /// Move to `next`, stamping timestamps. Rejects illegal edges.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::Validation(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let now = chrono::Utc::now();
        match next {
            JobStatus::Pending => {
                self.error_message = None;
                self.output_paths.clear();
                self.started_at = None;
                self.finished_at = None;
            }
            JobStatus::Processing => self.started_at = Some(now),
            _ => self.finished_at = Some(now),
        }
        self.status = next;
        Ok(())
    }
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.total += 1;
            match record.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Skipped => stats.skipped += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

pub fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- state machine --

    #[test]
    fn happy_path_transitions() {
        let mut job = JobRecord::new(1, "/a/b.png");
        job.transition(JobStatus::Processing).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.finished_at.is_some());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn completed_is_final() {
        let mut job = JobRecord::new(1, "/a/b.png");
        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.transition(JobStatus::Pending).is_err());
        assert!(job.transition(JobStatus::Processing).is_err());
    }

    #[test]
    fn pending_cannot_skip_processing() {
        let mut job = JobRecord::new(1, "/a/b.png");
        assert!(job.transition(JobStatus::Completed).is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn retry_resets_failure_details() {
        let mut job = JobRecord::new(7, "/a/b.png");
        job.transition(JobStatus::Processing).unwrap();
        job.transition(JobStatus::Failed).unwrap();
        job.error_message = Some("boom".into());
        job.transition(JobStatus::Pending).unwrap();
        assert!(job.error_message.is_none());
        assert!(job.finished_at.is_none());
    }

    // -- stats --

    #[test]
    fn stats_count_by_status() {
        let mut a = JobRecord::new(1, "a.png");
        let b = JobRecord::new(2, "b.png");
        a.transition(JobStatus::Processing).unwrap();
        let stats = QueueStats::from_records([&a, &b]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(a.filename(), "a.png");
    }
}
