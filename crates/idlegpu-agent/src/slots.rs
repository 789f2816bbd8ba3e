//! Single-slot manager for the resident heavy workload
//!
//! The accelerator holds at most one heavy model at a time: either the
//! conversational model or the embedding model. [`WorkloadSlotManager`] owns
//! that slot. Only the idle scheduler swaps it; everything else reads it
//! through a [`SlotView`].

use crate::Result;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idlegpu_core::WorkloadKind;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A model could not be loaded into the slot
#[derive(Debug, Error)]
#[error("Failed to load {kind} workload '{name}': {reason}")]
pub struct LoadError {
    pub kind: WorkloadKind,
    pub name: String,
    pub reason: String,
}

impl LoadError {
    pub fn new(kind: WorkloadKind, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// A loaded heavy resource
#[async_trait]
pub trait Workload: Send + Sync {
    /// Release backend resources. Backends without an explicit unload keep the default.
    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    /// Embed one piece of text
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(crate::AgentError::Workload(
            "workload does not produce embeddings".to_string(),
        ))
    }
}

/// Loads workloads by kind and name
#[async_trait]
pub trait WorkloadLoader: Send + Sync {
    async fn load(&self, kind: WorkloadKind, name: &str) -> Result<Arc<dyn Workload>>;
}

/// Reference to the resident workload.
///
/// Valid until the next swap; compare [`WorkloadHandle::generation`] or ask
/// [`SlotView::is_current`] before relying on an old handle.
#[derive(Clone)]
pub struct WorkloadHandle {
    kind: WorkloadKind,
    name: String,
    loaded_at: DateTime<Utc>,
    generation: u64,
    workload: Arc<dyn Workload>,
}

impl WorkloadHandle {
    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Load counter value when this handle became resident
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn workload(&self) -> &Arc<dyn Workload> {
        &self.workload
    }

    /// Embed text through the underlying workload
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.workload.embed(text).await
    }

    fn matches(&self, kind: WorkloadKind, name: &str) -> bool {
        self.kind == kind && self.name == name
    }
}

impl fmt::Debug for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadHandle")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("loaded_at", &self.loaded_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// What occupies the slot right now
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatus {
    pub kind: Option<WorkloadKind>,
    pub name: Option<String>,
    pub loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub generation: u64,
    pub load_count: u64,
}

struct SlotShared {
    resident: RwLock<Option<WorkloadHandle>>,
    generation: AtomicU64,
    loads: AtomicU64,
}

impl SlotShared {
    fn status(&self) -> SlotStatus {
        let resident = self.resident.read();
        SlotStatus {
            kind: resident.as_ref().map(|h| h.kind),
            name: resident.as_ref().map(|h| h.name.clone()),
            loaded: resident.is_some(),
            loaded_at: resident.as_ref().map(|h| h.loaded_at),
            generation: self.generation.load(Ordering::Acquire),
            load_count: self.loads.load(Ordering::Relaxed),
        }
    }
}

/// Owner of the single resident workload
pub struct WorkloadSlotManager {
    loader: Arc<dyn WorkloadLoader>,
    shared: Arc<SlotShared>,
    // serializes acquire/release; held across loads
    swap: tokio::sync::Mutex<()>,
}

impl WorkloadSlotManager {
    pub fn new(loader: Arc<dyn WorkloadLoader>) -> Self {
        Self {
            loader,
            shared: Arc::new(SlotShared {
                resident: RwLock::new(None),
                generation: AtomicU64::new(0),
                loads: AtomicU64::new(0),
            }),
            swap: tokio::sync::Mutex::new(()),
        }
    }

    /// Make `kind`/`name` the resident workload.
    ///
    /// Returns the resident handle unchanged when it already matches.
    /// Otherwise the current workload is unloaded first, then the new one is
    /// loaded. A failed load leaves the slot empty.
    pub async fn acquire(
        &self,
        kind: WorkloadKind,
        name: &str,
    ) -> std::result::Result<WorkloadHandle, LoadError> {
        let _swap = self.swap.lock().await;

        let cached = self
            .shared
            .resident
            .read()
            .as_ref()
            .filter(|current| current.matches(kind, name))
            .cloned();
        if let Some(current) = cached {
            debug!("Workload {} '{}' already resident", kind, name);
            return Ok(current);
        }

        self.release_locked().await;

        info!("Loading {} workload: {}", kind, name);
        let workload = match self.loader.load(kind, name).await {
            Ok(workload) => workload,
            Err(e) => {
                error!("Error loading {} workload {}: {}", kind, name, e);
                return Err(LoadError::new(kind, name, e.to_string()));
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.loads.fetch_add(1, Ordering::Relaxed);

        let handle = WorkloadHandle {
            kind,
            name: name.to_string(),
            loaded_at: Utc::now(),
            generation,
            workload,
        };
        *self.shared.resident.write() = Some(handle.clone());

        info!("Workload {} '{}' resident (generation {})", kind, name, generation);
        Ok(handle)
    }

    /// Drop the resident workload. Returns whether anything was resident.
    pub async fn release(&self) -> bool {
        let _swap = self.swap.lock().await;
        self.release_locked().await
    }

    async fn release_locked(&self) -> bool {
        let previous = self.shared.resident.write().take();
        let Some(handle) = previous else {
            return false;
        };

        info!("Unloading {} workload: {}", handle.kind, handle.name);
        if let Err(e) = handle.workload.unload().await {
            warn!(
                "Unload of {} '{}' reported an error, dropping it anyway: {}",
                handle.kind, handle.name, e
            );
        }
        true
    }

    /// Current occupant, for status reporting
    pub fn current(&self) -> SlotStatus {
        self.shared.status()
    }

    /// Number of loads performed so far
    pub fn load_count(&self) -> u64 {
        self.shared.loads.load(Ordering::Relaxed)
    }

    /// Read-only view for foreground request handling
    pub fn view(&self) -> SlotView {
        SlotView {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only access to the slot. Cannot load or release.
#[derive(Clone)]
pub struct SlotView {
    shared: Arc<SlotShared>,
}

impl SlotView {
    pub fn current(&self) -> SlotStatus {
        self.shared.status()
    }

    /// Whether `handle` is still the resident workload
    pub fn is_current(&self, handle: &WorkloadHandle) -> bool {
        self.shared
            .resident
            .read()
            .as_ref()
            .map(|resident| resident.generation == handle.generation)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLoader;

    fn manager() -> (Arc<MockLoader>, WorkloadSlotManager) {
        let loader = Arc::new(MockLoader::new());
        let manager = WorkloadSlotManager::new(loader.clone());
        (loader, manager)
    }

    #[tokio::test]
    async fn test_acquire_same_workload_loads_once() {
        let (loader, manager) = manager();

        let first = manager.acquire(WorkloadKind::Embedding, "mpnet").await.unwrap();
        let second = manager.acquire(WorkloadKind::Embedding, "mpnet").await.unwrap();

        assert_eq!(loader.load_count(), 1);
        assert_eq!(first.generation(), second.generation());
        assert_eq!(manager.load_count(), 1);
    }

    #[tokio::test]
    async fn test_swap_unloads_previous() {
        let (loader, manager) = manager();

        let chat = manager.acquire(WorkloadKind::Conversational, "llama2").await.unwrap();
        let embed = manager.acquire(WorkloadKind::Embedding, "mpnet").await.unwrap();

        assert_eq!(loader.load_count(), 2);
        assert_eq!(loader.unload_count(), 1);
        assert!(embed.generation() > chat.generation());

        let view = manager.view();
        assert!(!view.is_current(&chat));
        assert!(view.is_current(&embed));

        let status = manager.current();
        assert_eq!(status.kind, Some(WorkloadKind::Embedding));
        assert_eq!(status.name.as_deref(), Some("mpnet"));
        assert!(status.loaded);
    }

    #[tokio::test]
    async fn test_same_kind_different_name_reloads() {
        let (loader, manager) = manager();

        manager.acquire(WorkloadKind::Conversational, "llama2").await.unwrap();
        manager.acquire(WorkloadKind::Conversational, "mistral").await.unwrap();

        assert_eq!(loader.load_count(), 2);
        assert_eq!(loader.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_slot_empty() {
        let (loader, manager) = manager();
        manager.acquire(WorkloadKind::Conversational, "llama2").await.unwrap();

        loader.fail_model("broken");
        let err = manager.acquire(WorkloadKind::Embedding, "broken").await.unwrap_err();
        assert_eq!(err.kind, WorkloadKind::Embedding);
        assert_eq!(err.name, "broken");

        let status = manager.current();
        assert!(!status.loaded);
        assert_eq!(status.kind, None);
        assert_eq!(loader.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_release() {
        let (loader, manager) = manager();
        assert!(!manager.release().await);

        let handle = manager.acquire(WorkloadKind::Embedding, "mpnet").await.unwrap();
        assert!(manager.release().await);
        assert!(!manager.release().await);

        assert!(!manager.current().loaded);
        assert!(!manager.view().is_current(&handle));
        assert_eq!(loader.unload_count(), 1);

        // release drops the cache; the next acquire loads again
        manager.acquire(WorkloadKind::Embedding, "mpnet").await.unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_at_most_one_resident() {
        let (loader, manager) = manager();
        let sequence = [
            (WorkloadKind::Conversational, "llama2"),
            (WorkloadKind::Embedding, "mpnet"),
            (WorkloadKind::Embedding, "mpnet"),
            (WorkloadKind::Conversational, "llama2"),
            (WorkloadKind::Embedding, "minilm"),
        ];

        for (kind, name) in sequence {
            manager.acquire(kind, name).await.unwrap();
            assert!(loader.live_count() <= 1);
        }
        manager.release().await;
        assert_eq!(loader.live_count(), 0);
    }

    #[tokio::test]
    async fn test_embed_through_handle() {
        let (_loader, manager) = manager();
        let handle = manager.acquire(WorkloadKind::Embedding, "mpnet").await.unwrap();
        let vector = handle.embed("hello").await.unwrap();
        assert!(!vector.is_empty());

        let chat = manager.acquire(WorkloadKind::Conversational, "llama2").await.unwrap();
        assert!(chat.embed("hello").await.is_err());
    }
}
