//! Configuration management for idlegpu
//!
//! Provides a unified configuration system that supports YAML files and
//! environment variable overrides on top of built-in defaults.

use crate::{AcceleratorBackend, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "IDLEGPU_CONFIG";

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "IDLEGPU";

/// Main configuration structure for the scheduling subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Idle scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Resource monitor configuration
    pub monitor: MonitorConfig,

    /// Heavy workload (model) configuration
    pub workloads: WorkloadConfig,

    /// Background indexing configuration
    pub indexing: IndexingConfig,

    /// Observer broadcast configuration
    pub broadcast: BroadcastConfig,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        // Start with defaults
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(config::File::with_name(&config_path).required(true));
        } else {
            for path in &["./idlegpu.yaml", "/etc/idlegpu/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        // IDLEGPU_SCHEDULER__IDLE_THRESHOLD_SECONDS=900
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.monitor.validate()?;
        self.workloads.validate()?;
        self.indexing.validate()?;
        self.broadcast.validate()?;
        Ok(())
    }
}

/// Idle scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Background work may start only below this utilization (percent)
    pub utilization_threshold_percent: f64,

    /// Seconds without foreground activity before background work may start
    pub idle_threshold_seconds: u64,

    /// Decision cadence of the scheduler loop (seconds)
    pub poll_interval_seconds: f64,

    /// Upper bound on waiting for a running job during shutdown (seconds)
    pub shutdown_timeout_seconds: f64,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        let threshold = self.utilization_threshold_percent;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 100.0 {
            return Err(crate::Error::config(format!(
                "Utilization threshold must be in (0, 100], got {}",
                threshold
            )));
        }

        if self.idle_threshold_seconds == 0 {
            return Err(crate::Error::config("Idle threshold must be greater than zero"));
        }

        validate_seconds("Scheduler poll interval", self.poll_interval_seconds)?;
        validate_seconds("Shutdown timeout", self.shutdown_timeout_seconds)?;

        Ok(())
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout_seconds)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            utilization_threshold_percent: 10.0,
            idle_threshold_seconds: 600,
            poll_interval_seconds: 30.0,
            shutdown_timeout_seconds: 30.0,
        }
    }
}

/// Resource monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Telemetry backend
    pub backend: AcceleratorBackend,

    /// Polling interval (seconds)
    pub poll_interval_seconds: f64,

    /// Index of the device to watch
    pub device_index: u32,

    /// Path or name of the `nvidia-smi` binary
    pub nvidia_smi_path: String,

    /// Maximum time a single probe may take (seconds)
    pub probe_timeout_seconds: f64,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        validate_seconds("Resource poll interval", self.poll_interval_seconds)?;
        validate_seconds("Probe timeout", self.probe_timeout_seconds)?;

        if self.backend == AcceleratorBackend::NvidiaSmi && self.nvidia_smi_path.trim().is_empty() {
            return Err(crate::Error::config("nvidia-smi path must not be empty"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_seconds)
    }

    /// Builder-style backend override
    pub fn with_backend(mut self, backend: AcceleratorBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Builder-style poll interval override
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_seconds = interval.as_secs_f64();
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backend: AcceleratorBackend::NvidiaSmi,
            poll_interval_seconds: 1.0,
            device_index: 0,
            nvidia_smi_path: "nvidia-smi".to_string(),
            probe_timeout_seconds: 5.0,
        }
    }
}

/// Heavy workload configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Ollama embedding model swapped in for background indexing
    pub embedding_model: String,

    /// Conversational model loaded back when an indexing job ends
    pub chat_model: String,

    /// Base URL of the Ollama server hosting the models
    pub ollama_url: String,

    /// How long Ollama keeps a warmed model resident
    pub keep_alive: String,

    /// Timeout for load and embed requests (seconds)
    pub request_timeout_seconds: u64,
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.embedding_model.trim().is_empty() {
            return Err(crate::Error::config("Embedding model name must not be empty"));
        }
        if self.chat_model.trim().is_empty() {
            return Err(crate::Error::config("Chat model name must not be empty"));
        }
        if self.ollama_url.trim().is_empty() {
            return Err(crate::Error::config("Ollama URL must not be empty"));
        }
        if self.request_timeout_seconds == 0 {
            return Err(crate::Error::config("Request timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            embedding_model: "nomic-embed-text".to_string(),
            chat_model: "llama2".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            keep_alive: "10m".to_string(),
            request_timeout_seconds: 120,
        }
    }
}

/// Background indexing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Approximate chunk size in tokens
    pub chunk_size: usize,

    /// Directory scanned for documents to index
    pub documents_dir: Option<PathBuf>,
}

impl IndexingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(crate::Error::config("Chunk size must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            documents_dir: None,
        }
    }
}

/// Observer broadcast configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Per-observer send timeout (seconds)
    pub send_timeout_seconds: f64,
}

impl BroadcastConfig {
    pub fn validate(&self) -> Result<()> {
        validate_seconds("Send timeout", self.send_timeout_seconds)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.send_timeout_seconds)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_timeout_seconds: 5.0,
        }
    }
}

fn validate_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(crate::Error::config(format!(
            "{} must be a positive number of seconds, got {}",
            name, value
        )));
    }
    Ok(())
}
