//! Core agent implementation

use crate::hub::BroadcastHub;
use crate::indexing::{
    ChunkingIndexer, DirectoryDocumentStore, DocumentStore, InMemoryDocumentStore,
    InMemoryVectorSink, IndexingTask, VectorSink,
};
use crate::ollama::OllamaLoader;
use crate::scheduler::{IdleScheduler, IndexingPipeline};
use crate::slots::{SlotView, WorkloadLoader, WorkloadSlotManager};
use crate::{config::AgentConfig, server, AgentError, Result};

use async_trait::async_trait;
use idlegpu_core::{ResourceSnapshot, StatusEvent};
use idlegpu_monitor::{AcceleratorProbe, ResourceMonitor, SampleListener};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shared handles passed to request handlers.
///
/// Foreground code only gets a [`SlotView`]; swapping the resident workload
/// stays with the scheduler.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    pub monitor: Arc<ResourceMonitor>,
    pub slots: SlotView,
    pub hub: Arc<BroadcastHub>,
    pub scheduler: Arc<IdleScheduler>,
}

/// The idlegpu agent
pub struct Agent {
    context: AgentContext,
    slot_manager: Arc<WorkloadSlotManager>,
    server: Option<ServerHandle>,
}

/// Handle to the running HTTP server
struct ServerHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

/// Publishes accelerator load to observers after every successful poll
struct GpuStatusRelay {
    scheduler: Weak<IdleScheduler>,
    hub: Arc<BroadcastHub>,
}

#[async_trait]
impl SampleListener for GpuStatusRelay {
    async fn on_sample(&self, snapshot: &ResourceSnapshot) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return;
        };
        self.hub
            .publish(&StatusEvent::gpu_status(scheduler.is_indexing(), snapshot.utilization))
            .await;
    }
}

impl Agent {
    /// Start the monitor, the scheduler and the HTTP server
    pub async fn start(&mut self) -> Result<()> {
        let config = Arc::clone(&self.context.config);
        info!("Starting idlegpu agent: {}", config.agent.name);

        config.validate()?;

        if let Some(pid_file) = config.pid_file_path() {
            write_pid_file(pid_file)?;
        }

        self.context.monitor.set_listener(Arc::new(GpuStatusRelay {
            scheduler: Arc::downgrade(&self.context.scheduler),
            hub: Arc::clone(&self.context.hub),
        }));
        self.context.monitor.start();
        self.context.scheduler.start();

        if config.http.enabled && self.server.is_none() {
            self.start_server().await?;
        }

        info!("idlegpu agent started successfully");
        Ok(())
    }

    /// Stop everything started by [`Agent::start`] and unload the resident workload
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping idlegpu agent");

        if let Some(server) = self.server.take() {
            self.stop_server(server).await;
        }

        self.context.scheduler.stop().await;
        self.context.monitor.stop().await;
        self.slot_manager.release().await;

        if let Some(pid_file) = self.context.config.pid_file_path() {
            if pid_file.exists() {
                if let Err(e) = std::fs::remove_file(pid_file) {
                    warn!("Failed to remove PID file: {}", e);
                }
            }
        }

        info!("idlegpu agent stopped");
        Ok(())
    }

    /// Run the agent until a shutdown signal is received
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(wait_for_shutdown_signal()).await
    }

    /// Run the agent until `shutdown` resolves
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    pub fn config(&self) -> &AgentConfig {
        &self.context.config
    }

    /// Handles for request handlers and embedding callers
    pub fn context(&self) -> AgentContext {
        self.context.clone()
    }

    /// Address the HTTP server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|server| server.addr)
    }

    async fn start_server(&mut self) -> Result<()> {
        let bind_addr = self.context.config.http.bind_addr;
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| AgentError::Service(format!("Failed to bind to {}: {}", bind_addr, e)))?;
        let addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve(self.context.clone(), listener, async move {
            let _ = shutdown_rx.await;
        }));

        self.server = Some(ServerHandle {
            addr,
            shutdown,
            handle,
        });
        Ok(())
    }

    async fn stop_server(&self, server: ServerHandle) {
        let ServerHandle {
            addr,
            shutdown,
            mut handle,
        } = server;
        let _ = shutdown.send(());

        // open websockets hold graceful shutdown
        let timeout = self.context.config.core.scheduler.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => info!("HTTP server on {} stopped", addr),
            Ok(Ok(Err(e))) => error!("HTTP server stopped with error: {}", e),
            Ok(Err(e)) => error!("HTTP server task failed: {}", e),
            Err(_) => {
                warn!("HTTP server did not drain within {:?}, aborting", timeout);
                handle.abort();
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // Best effort cleanup
        if let Some(server) = self.server.take() {
            let _ = server.shutdown.send(());
        }
    }
}

fn write_pid_file(pid_file: &Path) -> Result<()> {
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            AgentError::Config(format!("Failed to create PID file directory: {}", e))
        })?;
    }

    let pid = std::process::id();
    std::fs::write(pid_file, pid.to_string())
        .map_err(|e| AgentError::Config(format!("Failed to write PID file: {}", e)))?;

    info!("Wrote PID {} to {}", pid, pid_file.display());
    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = wait_for_ctrl_c() => info!("Received Ctrl+C signal"),
        _ = wait_for_termination() => info!("Received termination signal"),
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    std::future::pending::<()>().await;
}

/// Builder for creating agents
#[derive(Default)]
pub struct AgentBuilder {
    config: Option<AgentConfig>,
    loader: Option<Arc<dyn WorkloadLoader>>,
    probe: Option<Arc<dyn AcceleratorProbe>>,
    store: Option<Arc<dyn DocumentStore>>,
    indexer: Option<Arc<dyn IndexingTask>>,
    sink: Option<Arc<dyn VectorSink>>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this loader instead of the Ollama one
    pub fn with_loader(mut self, loader: Arc<dyn WorkloadLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Use this probe instead of the configured backend
    pub fn with_probe(mut self, probe: Arc<dyn AcceleratorProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn IndexingTask>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// Where the default indexer writes its vectors
    pub fn with_vector_sink(mut self, sink: Arc<dyn VectorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the agent. Nothing runs until [`Agent::start`].
    pub async fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();

        let monitor = match self.probe {
            Some(probe) => ResourceMonitor::with_probe(config.core.monitor.clone(), Some(probe)),
            None => ResourceMonitor::new(config.core.monitor.clone()).await,
        };
        let monitor = Arc::new(monitor);

        let loader: Arc<dyn WorkloadLoader> = match self.loader {
            Some(loader) => loader,
            None => Arc::new(OllamaLoader::new(&config.core.workloads)?),
        };
        let slot_manager = Arc::new(WorkloadSlotManager::new(loader));

        let hub = Arc::new(BroadcastHub::new(config.core.broadcast.send_timeout()));

        let documents_dir = &config.core.indexing.documents_dir;
        let store: Arc<dyn DocumentStore> = match (self.store, documents_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => {
                info!("Indexing documents under {}", dir.display());
                Arc::new(DirectoryDocumentStore::new(dir.clone()))
            }
            (None, None) => Arc::new(InMemoryDocumentStore::new()),
        };

        let indexer: Arc<dyn IndexingTask> = match self.indexer {
            Some(indexer) => indexer,
            None => {
                let sink = self
                    .sink
                    .unwrap_or_else(|| Arc::new(InMemoryVectorSink::new()) as Arc<dyn VectorSink>);
                Arc::new(ChunkingIndexer::new(sink, config.core.indexing.chunk_size))
            }
        };

        let scheduler = Arc::new(IdleScheduler::new(
            config.core.scheduler.clone(),
            config.core.workloads.embedding_model.clone(),
            Some(config.core.workloads.chat_model.clone()),
            Arc::clone(&monitor),
            Arc::clone(&slot_manager),
            Arc::clone(&hub),
            IndexingPipeline { store, indexer },
        ));

        let context = AgentContext {
            config: Arc::new(config),
            monitor,
            slots: slot_manager.view(),
            hub,
            scheduler,
        };

        Ok(Agent {
            context,
            slot_manager,
            server: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLoader, RecordingObserver};
    use idlegpu_core::AcceleratorBackend;
    use idlegpu_monitor::mock::MockProbe;
    use tempfile::TempDir;

    fn test_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.http.bind_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    async fn build(config: AgentConfig, loader: Arc<MockLoader>) -> Agent {
        AgentBuilder::new()
            .with_config(config)
            .with_loader(loader)
            .with_probe(Arc::new(MockProbe::with_utilization(4.0)))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_agent_builder() {
        let agent = build(test_config(), Arc::new(MockLoader::new())).await;

        assert_eq!(agent.config().agent.name, "idlegpud");
        assert!(agent.local_addr().is_none());
        assert!(!agent.context().scheduler.is_running());
        assert!(!agent.context().monitor.is_running());
    }

    #[tokio::test]
    async fn test_builder_without_accelerator() {
        let mut config = test_config();
        config.core.monitor.backend = AcceleratorBackend::None;
        let agent = AgentBuilder::new()
            .with_config(config)
            .with_loader(Arc::new(MockLoader::new()))
            .build()
            .await
            .unwrap();

        assert!(!agent.context().monitor.has_probe());
        assert!(!agent.context().monitor.snapshot().available);
    }

    #[tokio::test]
    async fn test_agent_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.agent.pid_file = Some(temp_dir.path().join("run").join("idlegpud.pid"));

        let loader = Arc::new(MockLoader::new());
        let mut agent = build(config, loader.clone()).await;
        agent.start().await.unwrap();

        let pid_file = agent.config().pid_file_path().unwrap().clone();
        assert!(pid_file.exists());
        assert!(agent.context().monitor.is_running());
        assert!(agent.context().scheduler.is_running());

        let addr = agent.local_addr().unwrap();
        let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");

        agent.stop().await.unwrap();
        assert!(!pid_file.exists());
        assert!(!agent.context().monitor.is_running());
        assert!(!agent.context().scheduler.is_running());
        assert!(agent.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_start() {
        let mut config = test_config();
        config.core.scheduler.utilization_threshold_percent = 0.0;

        let mut agent = build(config, Arc::new(MockLoader::new())).await;
        assert!(agent.start().await.is_err());
        assert!(!agent.context().scheduler.is_running());
    }

    #[tokio::test]
    async fn test_samples_are_relayed_to_observers() {
        let mut config = test_config();
        config.http.enabled = false;

        let mut agent = build(config, Arc::new(MockLoader::new())).await;
        let context = agent.context();
        let observer = Arc::new(RecordingObserver::new());
        context.hub.register(observer.clone()).await;

        agent.start().await.unwrap();
        context.monitor.poll_once().await;
        agent.stop().await.unwrap();

        let update = observer
            .messages()
            .into_iter()
            .find(|m| m["type"] == "gpu_status_update")
            .unwrap();
        assert_eq!(update["payload"]["is_indexing"], false);
        assert_eq!(update["payload"]["gpu_utilization"], 4.0);
    }

    #[tokio::test]
    async fn test_stop_releases_resident_workload() {
        let mut config = test_config();
        config.http.enabled = false;

        let loader = Arc::new(MockLoader::new());
        let mut agent = build(config, loader.clone()).await;
        agent.start().await.unwrap();

        agent
            .slot_manager
            .acquire(idlegpu_core::WorkloadKind::Conversational, "llama2")
            .await
            .unwrap();
        assert!(agent.context().slots.current().loaded);

        agent.run_until(async {}).await.unwrap();
        assert_eq!(loader.live_count(), 0);
        assert!(!agent.context().slots.current().loaded);
    }
}
