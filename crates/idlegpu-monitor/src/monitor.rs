//! Background resource monitor

use crate::probe::{create_probe, AcceleratorProbe};

use async_trait::async_trait;
use idlegpu_core::{MonitorConfig, ResourceSnapshot};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Hook invoked after every successful poll
#[async_trait]
pub trait SampleListener: Send + Sync {
    async fn on_sample(&self, snapshot: &ResourceSnapshot);
}

/// Polls the accelerator on a fixed interval and keeps the latest snapshot.
///
/// Readers never wait for a poll: [`ResourceMonitor::snapshot`] returns the
/// last good sample, or an unavailable snapshot if there never was one.
pub struct ResourceMonitor {
    config: MonitorConfig,
    shared: Arc<Shared>,
    task: Mutex<Option<PollTask>>,
}

struct Shared {
    probe: Option<Arc<dyn AcceleratorProbe>>,
    latest: watch::Sender<ResourceSnapshot>,
    listener: RwLock<Option<Arc<dyn SampleListener>>>,
    consecutive_failures: AtomicU64,
    probe_timeout: Duration,
}

/// Handle to the running poll loop
struct PollTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    /// Create a monitor for the configured backend.
    ///
    /// A backend that cannot be initialized leaves the monitor without a
    /// probe; it then reports the accelerator as unavailable.
    pub async fn new(config: MonitorConfig) -> Self {
        let probe = match create_probe(&config).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!("Accelerator probe unavailable, continuing without GPU telemetry: {}", e);
                None
            }
        };
        Self::with_probe(config, probe)
    }

    /// Create a monitor around an explicit probe
    pub fn with_probe(config: MonitorConfig, probe: Option<Arc<dyn AcceleratorProbe>>) -> Self {
        let (latest, _) = watch::channel(ResourceSnapshot::unavailable());
        let probe_timeout = config.probe_timeout();

        Self {
            config,
            shared: Arc::new(Shared {
                probe,
                latest,
                listener: RwLock::new(None),
                consecutive_failures: AtomicU64::new(0),
                probe_timeout,
            }),
            task: Mutex::new(None),
        }
    }

    /// Register the hook notified after each successful poll
    pub fn set_listener(&self, listener: Arc<dyn SampleListener>) {
        *self.shared.listener.write() = Some(listener);
    }

    /// Start the poll loop. Calling this while it already runs does nothing.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if let Some(existing) = task.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Resource monitor already running");
                return;
            }
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.config.poll_interval();
        let handle = tokio::spawn(poll_loop(shared, interval, shutdown_rx));

        *task = Some(PollTask { shutdown, handle });
        info!("Resource monitoring started (interval {:?})", interval);
    }

    /// Stop the poll loop and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            debug!("Resource monitor not running");
            return;
        };

        let _ = task.shutdown.send(());
        if let Err(e) = task.handle.await {
            if !e.is_cancelled() {
                warn!("Resource monitor task ended abnormally: {}", e);
            }
        }
        info!("Resource monitoring stopped");
    }

    /// Whether the poll loop is active
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Latest snapshot, without waiting for a fresh poll
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.shared.latest.borrow().clone()
    }

    /// Receiver that observes every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.shared.latest.subscribe()
    }

    /// Poll once outside the loop. Returns whether a new snapshot was stored.
    pub async fn poll_once(&self) -> bool {
        self.shared.poll().await
    }

    /// Whether a telemetry backend is attached
    pub fn has_probe(&self) -> bool {
        self.shared.probe.is_some()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

impl Shared {
    async fn poll(&self) -> bool {
        let Some(probe) = &self.probe else {
            return false;
        };

        match tokio::time::timeout(self.probe_timeout, probe.sample()).await {
            Ok(Ok(sample)) => {
                let snapshot = ResourceSnapshot::sampled(
                    sample.utilization,
                    sample.memory_used,
                    sample.memory_total,
                );
                self.latest.send_replace(snapshot.clone());

                let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if failures > 0 {
                    info!("Accelerator telemetry recovered after {} failed polls", failures);
                }

                let listener = self.listener.read().clone();
                if let Some(listener) = listener {
                    listener.on_sample(&snapshot).await;
                }
                true
            }
            Ok(Err(e)) => {
                self.record_failure(&e.to_string(), e.is_retryable());
                false
            }
            Err(_) => {
                let reason = format!("probe timed out after {:?}", self.probe_timeout);
                self.record_failure(&reason, true);
                false
            }
        }
    }

    fn record_failure(&self, reason: &str, retryable: bool) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == 1 && !retryable {
            warn!("GPU metrics unavailable, keeping last snapshot: {}", reason);
        } else if failures == 1 {
            warn!("Error getting GPU metrics, keeping last snapshot: {}", reason);
        } else {
            debug!("GPU metrics poll failed ({} in a row): {}", failures, reason);
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, interval: Duration, mut shutdown: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                shared.poll().await;
            }
        }
    }

    debug!("Resource monitor loop exited");
}
