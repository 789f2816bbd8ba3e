//! Idle scheduler
//!
//! Decides when background indexing may use the accelerator and asks it to
//! stop when foreground activity resumes. The state machine is:
//!
//! ```text
//!   Idle ──(no job, utilization < threshold, idle >= threshold)──> Indexing
//!   Indexing ──(record_activity)──> CancelRequested
//!   Indexing | CancelRequested ──(job returns)──> Idle
//! ```
//!
//! All transitions go through one mutex that is never held across an await.
//! When a job ends, the foreground model (if any) is loaded back before the
//! scheduler reports idle.

use crate::hub::BroadcastHub;
use crate::indexing::{CancelCheck, DocumentStore, IndexingReport, IndexingTask};
use crate::slots::{LoadError, WorkloadHandle, WorkloadSlotManager};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use idlegpu_core::{SchedulerConfig, StatusEvent, WorkloadKind};
use idlegpu_monitor::ResourceMonitor;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Externally visible scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Indexing,
    CancelRequested,
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerPhase::Idle => write!(f, "idle"),
            SchedulerPhase::Indexing => write!(f, "indexing"),
            SchedulerPhase::CancelRequested => write!(f, "cancel_requested"),
        }
    }
}

/// Point-in-time scheduler status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub is_indexing: bool,
    pub cancel_requested: bool,
    pub phase: SchedulerPhase,
    pub last_activity: DateTime<Utc>,
    pub idle_seconds: f64,
}

/// Result of one decision cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A job was started
    Started,
    /// A job is already running
    AlreadyRunning,
    /// The accelerator is too busy
    Busy { utilization: f64 },
    /// Foreground activity is too recent
    NotIdle { idle_seconds: f64 },
    /// Job startup failed; the scheduler stays idle
    Failed,
}

/// Why a manual trigger was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TriggerRejection {
    #[error("Indexing already in progress")]
    AlreadyRunning,

    #[error("GPU unavailable")]
    AcceleratorUnavailable,

    #[error("Indexing could not start: {0}")]
    StartFailed(String),
}

struct SchedulerState {
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    running: bool,
    cancel_requested: bool,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            last_activity: Instant::now(),
            last_activity_at: Utc::now(),
            running: false,
            cancel_requested: false,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn idle_seconds(&self) -> f64 {
        self.last_activity.elapsed().as_secs_f64()
    }

    fn phase(&self) -> SchedulerPhase {
        match (self.running, self.cancel_requested) {
            (false, _) => SchedulerPhase::Idle,
            (true, false) => SchedulerPhase::Indexing,
            (true, true) => SchedulerPhase::CancelRequested,
        }
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_indexing: self.running,
            cancel_requested: self.cancel_requested,
            phase: self.phase(),
            last_activity: self.last_activity_at,
            idle_seconds: self.idle_seconds(),
        }
    }
}

/// Document source and worker for indexing jobs
#[derive(Clone)]
pub struct IndexingPipeline {
    pub store: Arc<dyn DocumentStore>,
    pub indexer: Arc<dyn IndexingTask>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    embedding_model: String,
    foreground_model: Option<String>,
    state: Mutex<SchedulerState>,
    monitor: Arc<ResourceMonitor>,
    slots: Arc<WorkloadSlotManager>,
    hub: Arc<BroadcastHub>,
    pipeline: IndexingPipeline,
    job: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
}

struct PollTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Controller that runs background indexing when the accelerator is idle
pub struct IdleScheduler {
    inner: Arc<SchedulerInner>,
    task: Mutex<Option<PollTask>>,
}

impl IdleScheduler {
    /// `foreground_model` is the conversational model loaded back after
    /// each job; `None` leaves the embedder resident.
    pub fn new(
        config: SchedulerConfig,
        embedding_model: impl Into<String>,
        foreground_model: Option<String>,
        monitor: Arc<ResourceMonitor>,
        slots: Arc<WorkloadSlotManager>,
        hub: Arc<BroadcastHub>,
        pipeline: IndexingPipeline,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                embedding_model: embedding_model.into(),
                foreground_model,
                state: Mutex::new(SchedulerState::new()),
                monitor,
                slots,
                hub,
                pipeline,
                job: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the decision loop. Calling this while it already runs does nothing.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if let Some(existing) = task.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Indexing scheduler already running");
                return;
            }
        }

        self.inner.stopping.store(false, Ordering::Release);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(decision_loop(inner, shutdown_rx));

        *task = Some(PollTask { shutdown, handle });
        info!(
            "Indexing scheduler started (every {:?}, threshold {:.1}%, idle after {:?})",
            self.inner.config.poll_interval(),
            self.inner.config.utilization_threshold_percent,
            self.inner.config.idle_threshold()
        );
    }

    /// Stop the decision loop, cancel a running job and wait for it,
    /// bounded by the shutdown timeout. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!("Indexing scheduler loop ended abnormally: {}", e);
                }
            }
            info!("Indexing scheduler stopped");
        }

        let job = self.inner.job.lock().take();
        let Some(mut job) = job else {
            return;
        };
        if job.is_finished() {
            return;
        }

        self.inner.request_cancel("shutdown");
        let timeout = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(timeout, &mut job).await.is_err() {
            warn!("Indexing job did not stop within {:?}, aborting it", timeout);
            job.abort();
            self.inner.finish_job(IndexingReport::default(), false).await;
        }
    }

    /// Whether the decision loop is active
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Run one decision cycle
    pub async fn tick(&self) -> CycleOutcome {
        self.inner.tick().await
    }

    /// Record foreground activity.
    ///
    /// Resets the idle timer and, if a job is running, asks it to stop.
    pub fn record_activity(&self) -> SchedulerPhase {
        let mut state = self.inner.state.lock();
        state.touch();
        if state.running && !state.cancel_requested {
            state.cancel_requested = true;
            info!("Foreground activity while indexing, cancellation requested");
        }
        state.phase()
    }

    /// Start indexing now, unless a job is running or there is no accelerator
    pub async fn trigger(&self) -> Result<SchedulerStatus, TriggerRejection> {
        if !self.inner.monitor.snapshot().available {
            return Err(TriggerRejection::AcceleratorUnavailable);
        }

        if !self.inner.try_claim() {
            return Err(TriggerRejection::AlreadyRunning);
        }

        info!("Manual indexing trigger accepted");
        self.inner
            .start_claimed()
            .await
            .map_err(TriggerRejection::StartFailed)?;
        Ok(self.get_status())
    }

    pub fn get_status(&self) -> SchedulerStatus {
        self.inner.state.lock().status()
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.inner.state.lock().phase()
    }

    pub fn is_indexing(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Wait for the current job, if any, to finish
    pub async fn wait_for_job(&self) {
        let job = self.inner.job.lock().take();
        if let Some(job) = job {
            if let Err(e) = job.await {
                if !e.is_cancelled() {
                    warn!("Indexing job ended abnormally: {}", e);
                }
            }
        }
    }
}

impl SchedulerInner {
    async fn tick(self: &Arc<Self>) -> CycleOutcome {
        let snapshot = self.monitor.snapshot();

        let outcome = {
            let mut state = self.state.lock();
            if state.running {
                CycleOutcome::AlreadyRunning
            } else if snapshot.utilization >= self.config.utilization_threshold_percent {
                CycleOutcome::Busy {
                    utilization: snapshot.utilization,
                }
            } else {
                let idle_seconds = state.idle_seconds();
                if idle_seconds < self.config.idle_threshold().as_secs_f64() {
                    CycleOutcome::NotIdle { idle_seconds }
                } else {
                    state.running = true;
                    state.cancel_requested = false;
                    CycleOutcome::Started
                }
            }
        };

        match outcome {
            CycleOutcome::Started => {
                info!(
                    "Accelerator idle ({:.1}% utilization), starting background indexing",
                    snapshot.utilization
                );
                if let Err(e) = self.start_claimed().await {
                    error!("Error starting background indexing: {}", e);
                    return CycleOutcome::Failed;
                }
                CycleOutcome::Started
            }
            other => {
                debug!("Scheduler cycle: {:?}", other);
                other
            }
        }
    }

    /// Claim the single job slot. Returns false if a job is already running.
    fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.running {
            return false;
        }
        state.running = true;
        state.cancel_requested = false;
        true
    }

    fn abandon_start(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.cancel_requested = false;
    }

    fn request_cancel(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.running && !state.cancel_requested {
            state.cancel_requested = true;
            info!("Indexing cancellation requested ({})", reason);
        }
    }

    /// Launch a job on an already claimed slot. On failure, including a
    /// panic in the loader, the claim is released and the reason returned.
    async fn start_claimed(self: &Arc<Self>) -> Result<(), String> {
        let launched = AssertUnwindSafe(Arc::clone(self).launch())
            .catch_unwind()
            .await;
        let reason = match launched {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("job startup panicked: {}", panic_message(panic.as_ref())),
        };
        self.abandon_start();
        Err(reason)
    }

    /// Swap in the embedder, announce the job and spawn it.
    async fn launch(self: Arc<Self>) -> Result<(), LoadError> {
        let embedder = self
            .slots
            .acquire(WorkloadKind::Embedding, &self.embedding_model)
            .await?;

        let utilization = self.monitor.snapshot().utilization;
        self.hub.publish(&StatusEvent::gpu_status(true, utilization)).await;

        let inner = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let pipeline = inner.pipeline.clone();
            let cancel = inner.cancel_check();

            let work = tokio::spawn(async move { run_pipeline(pipeline, embedder, cancel).await });
            let _abort = AbortOnDrop(work.abort_handle());
            let (report, completed) = match work.await {
                Ok(report) => (report, true),
                Err(e) => {
                    error!("Indexing job failed: {}", e);
                    (IndexingReport::default(), false)
                }
            };
            inner.finish_job(report, completed).await;
        });

        *self.job.lock() = Some(handle);
        Ok(())
    }

    fn cancel_check(self: &Arc<Self>) -> CancelCheck {
        let inner = Arc::clone(self);
        CancelCheck::new(move || inner.state.lock().cancel_requested)
    }

    /// Return to idle. Only the first call for a job publishes.
    async fn finish_job(&self, report: IndexingReport, completed: bool) {
        if !self.stopping.load(Ordering::Acquire) {
            self.restore_foreground().await;
        }

        let was_running = {
            let mut state = self.state.lock();
            let was_running = state.running;
            state.running = false;
            state.cancel_requested = false;
            state.touch();
            was_running
        };
        if !was_running {
            debug!("Indexing job already finished");
            return;
        }

        if completed {
            info!(
                "Background indexing {}: {} document(s), {} chunk(s), {} failed",
                if report.cancelled { "cancelled" } else { "completed" },
                report.documents_completed(),
                report.chunks_written(),
                report.failed.len()
            );
        }

        let utilization = self.monitor.snapshot().utilization;
        self.hub.publish(&StatusEvent::gpu_status(false, utilization)).await;
    }

    /// Runs while the job slot is still claimed so no new job can start
    /// and have its embedder evicted.
    async fn restore_foreground(&self) {
        let Some(model) = &self.foreground_model else {
            return;
        };
        if let Err(e) = self.slots.acquire(WorkloadKind::Conversational, model).await {
            warn!("Failed to restore foreground model after indexing: {}", e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Aborts the wrapped task when the supervising job is dropped
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_pipeline(
    pipeline: IndexingPipeline,
    embedder: WorkloadHandle,
    cancel: CancelCheck,
) -> IndexingReport {
    let documents = match pipeline.store.pending_documents().await {
        Ok(documents) => documents,
        Err(e) => {
            error!("Error listing documents to index: {}", e);
            return IndexingReport::default();
        }
    };

    if documents.is_empty() {
        info!("No documents pending indexing");
        return IndexingReport::default();
    }

    info!("Indexing {} document(s) with {}", documents.len(), embedder.name());
    let report = match pipeline.indexer.process(documents, &embedder, &cancel).await {
        Ok(report) => report,
        Err(e) => {
            error!("Error during indexing: {}", e);
            return IndexingReport::default();
        }
    };

    for document in &report.indexed {
        if let Err(e) = pipeline.store.mark_indexed(&document.doc_id, document.chunks).await {
            warn!("Failed to mark {} as indexed: {}", document.doc_id, e);
        }
    }
    report
}

async fn decision_loop(inner: Arc<SchedulerInner>, mut shutdown: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                inner.tick().await;
            }
        }
    }

    debug!("Indexing scheduler loop exited");
}
