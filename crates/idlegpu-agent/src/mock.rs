//! Mock collaborators for testing

use crate::hub::{Observer, ObserverError, ObserverId};
use crate::indexing::{CancelCheck, IndexedDocument, IndexingReport, IndexingTask};
use crate::slots::{Workload, WorkloadHandle, WorkloadLoader};
use crate::{AgentError, Result};

use async_trait::async_trait;
use idlegpu_core::{Document, WorkloadKind};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Loader that records every load and unload
#[derive(Default)]
pub struct MockLoader {
    loads: Mutex<Vec<(WorkloadKind, String)>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    unloads: Arc<AtomicUsize>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every load of this model from now on
    pub fn fail_model(&self, name: impl Into<String>) {
        self.failing.lock().insert(name.into());
    }

    /// Panic inside every load of this model from now on
    pub fn panic_on_model(&self, name: impl Into<String>) {
        self.panicking.lock().insert(name.into());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
        self.panicking.lock().clear();
    }

    pub fn load_count(&self) -> usize {
        self.loads.lock().len()
    }

    pub fn loads_of(&self, kind: WorkloadKind) -> usize {
        self.loads.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Workloads loaded and not yet unloaded
    pub fn live_count(&self) -> usize {
        self.load_count() - self.unload_count()
    }
}

#[async_trait]
impl WorkloadLoader for MockLoader {
    async fn load(&self, kind: WorkloadKind, name: &str) -> Result<Arc<dyn Workload>> {
        if self.failing.lock().contains(name) {
            return Err(AgentError::Workload(format!("mock failure loading {}", name)));
        }
        let panics = self.panicking.lock().contains(name);
        if panics {
            panic!("mock loader crashed loading {}", name);
        }
        self.loads.lock().push((kind, name.to_string()));

        let workload: Arc<dyn Workload> = Arc::new(MockWorkload {
            kind,
            unloads: Arc::clone(&self.unloads),
        });
        Ok(workload)
    }
}

/// Workload whose embeddings are derived from the text length
pub struct MockWorkload {
    kind: WorkloadKind,
    unloads: Arc<AtomicUsize>,
}

#[async_trait]
impl Workload for MockWorkload {
    async fn unload(&self) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self.kind {
            WorkloadKind::Embedding => Ok(vec![text.len() as f32, 1.0, 0.0]),
            WorkloadKind::Conversational => {
                Err(AgentError::Workload("mock chat model cannot embed".to_string()))
            }
        }
    }
}

/// Observer that keeps every message it receives
pub struct RecordingObserver {
    id: ObserverId,
    messages: Mutex<Vec<String>>,
    connected: AtomicBool,
    closed: AtomicBool,
    send_delay: Option<Duration>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            send_delay: None,
        }
    }

    /// Observer whose every send takes `delay` before it is recorded
    pub fn with_send_delay(delay: Duration) -> Self {
        Self {
            send_delay: Some(delay),
            ..Self::new()
        }
    }

    /// Received messages, parsed as JSON
    pub fn messages(&self) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect()
    }

    /// Make every following send fail
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Observer for RecordingObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    async fn send(&self, message: &str) -> std::result::Result<(), ObserverError> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ObserverError::Closed);
        }
        self.messages.lock().push(message.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Observer whose sends always fail
pub struct FailingObserver {
    id: ObserverId,
    closed: AtomicBool,
}

impl FailingObserver {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for FailingObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Observer for FailingObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    async fn send(&self, _message: &str) -> std::result::Result<(), ObserverError> {
        Err(ObserverError::Send("connection reset".to_string()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Observer whose sends never complete
pub struct StalledObserver {
    id: ObserverId,
}

impl StalledObserver {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for StalledObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Observer for StalledObserver {
    fn id(&self) -> ObserverId {
        self.id
    }

    async fn send(&self, _message: &str) -> std::result::Result<(), ObserverError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum IndexerBehavior {
    Complete,
    UntilCancelled,
    IgnoreCancel,
    Fail,
    Panic,
}

/// Scripted indexing task
pub struct MockIndexer {
    behavior: IndexerBehavior,
    calls: AtomicUsize,
    saw_cancel: AtomicBool,
}

impl MockIndexer {
    fn with_behavior(behavior: IndexerBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
        }
    }

    /// Indexes every document as one chunk
    pub fn completing() -> Self {
        Self::with_behavior(IndexerBehavior::Complete)
    }

    /// Works until the cancel check fires
    pub fn until_cancelled() -> Self {
        Self::with_behavior(IndexerBehavior::UntilCancelled)
    }

    /// Never returns
    pub fn ignoring_cancel() -> Self {
        Self::with_behavior(IndexerBehavior::IgnoreCancel)
    }

    /// Returns an error
    pub fn failing() -> Self {
        Self::with_behavior(IndexerBehavior::Fail)
    }

    /// Panics
    pub fn panicking() -> Self {
        Self::with_behavior(IndexerBehavior::Panic)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether the cancel check was observed firing
    pub fn saw_cancel(&self) -> bool {
        self.saw_cancel.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexingTask for MockIndexer {
    async fn process(
        &self,
        documents: Vec<Document>,
        embedder: &WorkloadHandle,
        cancel: &CancelCheck,
    ) -> Result<IndexingReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            IndexerBehavior::Complete => {
                let mut report = IndexingReport::default();
                for document in documents {
                    embedder.embed(&document.doc_id).await?;
                    report.indexed.push(IndexedDocument {
                        doc_id: document.doc_id,
                        chunks: 1,
                    });
                }
                Ok(report)
            }
            IndexerBehavior::UntilCancelled => {
                while !cancel.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                self.saw_cancel.store(true, Ordering::SeqCst);
                Ok(IndexingReport {
                    cancelled: true,
                    ..IndexingReport::default()
                })
            }
            IndexerBehavior::IgnoreCancel => {
                std::future::pending::<()>().await;
                Ok(IndexingReport::default())
            }
            IndexerBehavior::Fail => Err(AgentError::Indexing("mock indexing failure".to_string())),
            IndexerBehavior::Panic => panic!("mock indexer panicked"),
        }
    }
}
