//! Concurrent queue scheduler.
//!
//! One coordinating loop owns dispatch. Each tick it re-reads the worker
//! limit for the active backend from the live configuration, promotes
//! pending records to processing while below that limit, then waits a
//! bounded time for an in-flight job to finish. All records live behind a
//! single mutex; readers get copies.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use outpaint_core::cancel::sleep_or_cancel;
use outpaint_core::config::SharedConfigProvider;
use outpaint_core::error::OutpaintError;
use outpaint_core::job::{JobRecord, JobStatus, QueueStats, STOPPED_MESSAGE};
use outpaint_core::types::{BackendKind, JobId};
use outpaint_core::validation::is_supported_image;
use outpaint_pipeline::generator::{GenerateOutcome, JobOrchestrator};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::events::{QueueEvent, QueueEventKind, QueueEvents};

/// Upper bound on a single wait for in-flight jobs between ticks.
pub const DEFAULT_WAIT: Duration = Duration::from_millis(250);

/// Consecutive node-graph failures that trigger a fallback decision.
pub const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Unsupported format: {}", .0.display())]
    Unsupported(PathBuf),

    #[error("Already queued: {}", .0.display())]
    Duplicate(PathBuf),

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Job {0} is processing")]
    Busy(JobId),

    #[error("Queue is already running")]
    AlreadyRunning,
}

// ---------------------------------------------------------------------------
// Fallback decision
// ---------------------------------------------------------------------------

/// Consulted when the node-graph backend keeps failing. Returns a
/// replacement orchestrator, or `None` to keep going as is.
#[async_trait]
pub trait FallbackDecider: Send + Sync {
    async fn decide(&self, remaining: usize) -> Option<Arc<JobOrchestrator>>;
}

#[async_trait]
impl<F> FallbackDecider for F
where
    F: Fn(usize) -> Option<Arc<JobOrchestrator>> + Send + Sync,
{
    async fn decide(&self, remaining: usize) -> Option<Arc<JobOrchestrator>> {
        self(remaining)
    }
}

/// Always keeps the current backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineFallback;

#[async_trait]
impl FallbackDecider for DeclineFallback {
    async fn decide(&self, _remaining: usize) -> Option<Arc<JobOrchestrator>> {
        None
    }
}

/// Switches to the remote queue whenever a credential is configured.
pub struct SwitchToRemote {
    config: SharedConfigProvider,
}

impl SwitchToRemote {
    pub fn new(config: SharedConfigProvider) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FallbackDecider for SwitchToRemote {
    async fn decide(&self, remaining: usize) -> Option<Arc<JobOrchestrator>> {
        let mut config = self.config.current();
        if !config.has_fal_credential() {
            tracing::warn!(remaining, "No fal.ai API key configured, staying on ComfyUI");
            return None;
        }
        config.backend = BackendKind::FalAi;
        match JobOrchestrator::new(config) {
            Ok(orchestrator) => {
                tracing::info!(remaining, "Switching remaining jobs to fal.ai");
                Some(Arc::new(orchestrator))
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot build fal.ai orchestrator");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Terminal outcomes of one [`QueueScheduler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// The run ended because of [`QueueScheduler::stop`].
    pub stopped: bool,
}

struct Finished {
    id: JobId,
    backend: BackendKind,
    outcome: Result<GenerateOutcome, OutpaintError>,
}

pub struct QueueScheduler {
    jobs: Mutex<Vec<JobRecord>>,
    next_id: AtomicU64,
    config: SharedConfigProvider,
    orchestrator: RwLock<Arc<JobOrchestrator>>,
    decider: Arc<dyn FallbackDecider>,
    paused: AtomicBool,
    running: AtomicBool,
    stop: Mutex<CancellationToken>,
    node_graph_failures: AtomicU32,
    events: QueueEvents,
    wait: Duration,
}

impl QueueScheduler {
    pub fn new(config: SharedConfigProvider, orchestrator: Arc<JobOrchestrator>) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            config,
            orchestrator: RwLock::new(orchestrator),
            decider: Arc::new(DeclineFallback),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop: Mutex::new(CancellationToken::new()),
            node_graph_failures: AtomicU32::new(0),
            events: QueueEvents::default(),
            wait: DEFAULT_WAIT,
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn FallbackDecider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn orchestrator(&self) -> Arc<JobOrchestrator> {
        Arc::clone(&self.orchestrator.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install `orchestrator` for every job dispatched from now on.
    pub fn replace_orchestrator(&self, orchestrator: Arc<JobOrchestrator>) {
        let kind = orchestrator.active_kind();
        *self.orchestrator.write().unwrap_or_else(PoisonError::into_inner) = orchestrator;
        self.events.publish(QueueEventKind::BackendSwitched { backend: kind });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    // -- queue management --

    /// Queue `path` after checking it exists, is a supported image and is
    /// not already waiting or running.
    pub fn add(&self, path: impl Into<PathBuf>) -> Result<JobId, QueueError> {
        let path = path.into();
        if !path.is_file() {
            return Err(QueueError::NotFound(path));
        }
        if !is_supported_image(&path) {
            return Err(QueueError::Unsupported(path));
        }

        let mut jobs = self.jobs();
        let active = jobs.iter().any(|r| {
            r.source_path == path
                && matches!(r.status, JobStatus::Pending | JobStatus::Processing)
        });
        if active {
            return Err(QueueError::Duplicate(path));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        jobs.push(JobRecord::new(id, path.clone()));
        drop(jobs);

        tracing::debug!(job_id = id, path = %path.display(), "Job queued");
        self.events.publish(QueueEventKind::Added { job_id: id, path });
        Ok(id)
    }

    /// Move every failed record back to pending. Returns how many moved.
    pub fn retry_failed(&self) -> usize {
        let mut jobs = self.jobs();
        let mut moved = 0;
        for record in jobs.iter_mut().filter(|r| r.status == JobStatus::Failed) {
            if record.transition(JobStatus::Pending).is_ok() {
                moved += 1;
                self.publish_status(record);
            }
        }
        moved
    }

    /// Drop pending, failed and skipped records. Processing and completed
    /// records stay. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|r| matches!(r.status, JobStatus::Processing | JobStatus::Completed));
        let removed = before - jobs.len();
        drop(jobs);

        if removed > 0 {
            tracing::debug!(removed, "Queue cleared");
            self.events.publish(QueueEventKind::Cleared { removed });
        }
        removed
    }

    pub fn remove(&self, id: JobId) -> Result<JobRecord, QueueError> {
        let mut jobs = self.jobs();
        let index = jobs
            .iter()
            .position(|r| r.id == id)
            .ok_or(QueueError::UnknownJob(id))?;
        if jobs[index].status == JobStatus::Processing {
            return Err(QueueError::Busy(id));
        }
        Ok(jobs.remove(index))
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats::from_records(self.jobs().iter())
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.jobs().clone()
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs().iter().find(|r| r.id == id).cloned()
    }

    // -- run control --

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Queue paused");
            self.events.publish(QueueEventKind::Paused);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Queue resumed");
            self.events.publish(QueueEventKind::Resumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel in-flight jobs and end the current run. Pending records stay
    /// pending. A stop requested while idle ends the next run before it
    /// dispatches anything.
    pub fn stop(&self) {
        tracing::info!("Queue stop requested");
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.events.publish(QueueEventKind::StopRequested);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.node_graph_failures.load(Ordering::SeqCst)
    }

    /// Process pending records until none remain or [`stop`](Self::stop)
    /// is called.
    pub async fn run(&self) -> Result<RunSummary, QueueError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning);
        }
        let cancel = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        tracing::info!(pending = self.stats().pending, "Queue run started");
        let mut inflight: JoinSet<Finished> = JoinSet::new();
        let mut summary = RunSummary::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !self.is_paused() {
                self.dispatch(&mut inflight, &cancel);
            }

            if inflight.is_empty() {
                if self.stats().pending == 0 {
                    break;
                }
                if sleep_or_cancel(self.wait, &cancel).await.is_err() {
                    break;
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                joined = tokio::time::timeout(self.wait, inflight.join_next()) => {
                    if let Ok(Some(joined)) = joined {
                        self.finish(joined, &mut summary, &cancel).await;
                    }
                }
            }
        }

        // In-flight jobs share the token and return promptly once stopped.
        while let Some(joined) = inflight.join_next().await {
            self.finish(joined, &mut summary, &cancel).await;
        }

        summary.stopped = cancel.is_cancelled();
        if summary.stopped {
            summary.skipped += self.skip_processing();
        }

        // The token is spent; arm a fresh one for the next run.
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            stopped = summary.stopped,
            "Queue run finished",
        );
        self.events.publish(QueueEventKind::Finished);
        Ok(summary)
    }

    fn dispatch(&self, inflight: &mut JoinSet<Finished>, cancel: &CancellationToken) {
        let orchestrator = self.orchestrator();
        let limit = self
            .config
            .current()
            .workers
            .limit_for(orchestrator.active_kind());

        while inflight.len() < limit {
            let Some((id, path)) = self.claim_next() else {
                break;
            };
            tracing::info!(job_id = id, path = %path.display(), limit, "Dispatching job");

            let orchestrator = Arc::clone(&orchestrator);
            let token = cancel.clone();
            inflight.spawn(async move {
                let outcome = AssertUnwindSafe(orchestrator.generate(&path, &token))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(OutpaintError::Execution("Job panicked".into())));
                Finished {
                    id,
                    backend: orchestrator.active_kind(),
                    outcome,
                }
            });
        }
    }

    /// Promote the oldest pending record to processing.
    fn claim_next(&self) -> Option<(JobId, PathBuf)> {
        let mut jobs = self.jobs();
        let record = jobs.iter_mut().find(|r| r.status == JobStatus::Pending)?;
        record.transition(JobStatus::Processing).ok()?;
        self.publish_status(record);
        Some((record.id, record.source_path.clone()))
    }

    async fn finish(
        &self,
        joined: Result<Finished, JoinError>,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) {
        let finished = match joined {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!(error = %e, "Job task aborted");
                return;
            }
        };

        let backend_fault = matches!(&finished.outcome, Err(e) if e.is_backend_fault());
        let (status, error, outputs) = match finished.outcome {
            Ok(GenerateOutcome::Completed(result)) => {
                (JobStatus::Completed, None, result.output_paths)
            }
            Ok(GenerateOutcome::Skipped {
                reason,
                output_paths,
            }) => (JobStatus::Skipped, Some(reason), output_paths),
            Err(e) if e.is_cancelled() => {
                (JobStatus::Skipped, Some(STOPPED_MESSAGE.to_string()), Vec::new())
            }
            Err(e) => (JobStatus::Failed, Some(e.to_string()), Vec::new()),
        };
        self.record(finished.id, status, error, outputs);

        match status {
            JobStatus::Completed => {
                summary.completed += 1;
                self.node_graph_failures.store(0, Ordering::SeqCst);
            }
            JobStatus::Skipped => summary.skipped += 1,
            _ => {
                summary.failed += 1;
                // Bad inputs and unwritable outputs say nothing about the backend.
                if finished.backend == BackendKind::ComfyUi && backend_fault {
                    let failures = self.node_graph_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= FAILURE_THRESHOLD && !cancel.is_cancelled() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                tracing::info!("Stop requested, fallback decision abandoned");
                            }
                            () = self.consult_decider() => {}
                        }
                    }
                }
            }
        }
    }

    async fn consult_decider(&self) {
        if self.orchestrator().active_kind() != BackendKind::ComfyUi {
            self.node_graph_failures.store(0, Ordering::SeqCst);
            return;
        }
        let remaining = {
            let stats = self.stats();
            stats.pending + stats.processing
        };
        self.node_graph_failures.store(0, Ordering::SeqCst);
        tracing::warn!(
            remaining,
            threshold = FAILURE_THRESHOLD,
            "ComfyUI failing repeatedly, requesting fallback decision",
        );

        match self.decider.decide(remaining).await {
            Some(replacement) => self.replace_orchestrator(replacement),
            None => tracing::info!("Fallback declined, continuing on ComfyUI"),
        }
    }

    fn record(&self, id: JobId, status: JobStatus, error: Option<String>, outputs: Vec<PathBuf>) {
        let mut jobs = self.jobs();
        let Some(record) = jobs.iter_mut().find(|r| r.id == id) else {
            tracing::warn!(job_id = id, "Finished job no longer queued");
            return;
        };
        if let Err(e) = record.transition(status) {
            tracing::error!(job_id = id, error = %e, "Rejected status change");
            return;
        }
        record.error_message = error;
        record.output_paths = outputs;

        match status {
            JobStatus::Failed => tracing::warn!(
                job_id = id,
                path = %record.source_path.display(),
                error = record.error_message.as_deref().unwrap_or_default(),
                "Job failed",
            ),
            _ => tracing::info!(job_id = id, status = %status, "Job finished"),
        }
        self.publish_status(record);
    }

    /// Mark every still-processing record skipped. Returns how many.
    fn skip_processing(&self) -> usize {
        let mut jobs = self.jobs();
        let mut count = 0;
        for record in jobs.iter_mut().filter(|r| r.status == JobStatus::Processing) {
            if record.transition(JobStatus::Skipped).is_ok() {
                record.error_message = Some(STOPPED_MESSAGE.to_string());
                count += 1;
                self.publish_status(record);
            }
        }
        count
    }

    fn publish_status(&self, record: &JobRecord) {
        self.events.publish(QueueEventKind::StatusChanged {
            job_id: record.id,
            path: record.source_path.clone(),
            status: record.status,
            error: record.error_message.clone(),
            outputs: record.output_paths.clone(),
        });
    }
}

/// Queue every path, logging the ones rejected. Returns the ids added.
pub fn enqueue_all(scheduler: &QueueScheduler, paths: &[impl AsRef<Path>]) -> Vec<JobId> {
    paths
        .iter()
        .filter_map(|p| match scheduler.add(p.as_ref()) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "Not queued");
                None
            }
        })
        .collect()
}
