//! # idlegpu-agent
//!
//! Scheduling agent (idlegpud daemon) for idlegpu.
//!
//! This crate arbitrates one accelerator between interactive chat inference
//! and deferred document indexing. It owns the single resident model slot,
//! decides when the machine is idle enough to index, cancels indexing when
//! foreground activity resumes and pushes live status to connected observers.

pub mod agent;
pub mod config;
pub mod hub;
pub mod indexing;
pub mod ollama;
pub mod scheduler;
pub mod server;
pub mod slots;

// Mock collaborators for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export commonly used types
pub use agent::{Agent, AgentBuilder, AgentContext};
pub use crate::config::AgentConfig;
pub use hub::{BroadcastHub, Observer, ObserverId, PublishReport};
pub use indexing::{
    CancelCheck, ChunkingIndexer, DocumentStore, IndexingReport, IndexingTask, VectorSink,
};
pub use scheduler::{
    CycleOutcome, IdleScheduler, SchedulerPhase, SchedulerStatus, TriggerRejection,
};
pub use slots::{
    LoadError, SlotStatus, SlotView, Workload, WorkloadHandle, WorkloadLoader, WorkloadSlotManager,
};

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Workload error: {0}")]
    Workload(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Indexing error: {0}")]
    Indexing(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] idlegpu_core::Error),

    #[error("Probe error: {0}")]
    Probe(#[from] idlegpu_monitor::ProbeError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize the agent with logging and tracing
pub async fn init_agent(config: &AgentConfig) -> Result<Agent> {
    init_logging(&config.logging)?;

    tracing::info!("Initializing idlegpu agent with config: {:?}", config);

    AgentBuilder::new().with_config(config.clone()).build().await
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(logging_config: &crate::config::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let installed = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    installed.map_err(|e| AgentError::Config(format!("Failed to install log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_creation() {
        let config = AgentConfig::default();
        assert!(!config.agent.name.is_empty());
        assert_eq!(config.core.scheduler.idle_threshold_seconds, 600);
    }

    #[test]
    fn test_load_error_converts() {
        let err: AgentError =
            LoadError::new(idlegpu_core::WorkloadKind::Embedding, "mpnet", "oom").into();
        assert!(err.to_string().contains("mpnet"));
    }
}
