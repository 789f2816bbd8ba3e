//! Configuration management for the idlegpu agent

use crate::{AgentError, Result};
use idlegpu_core::config::{CONFIG_PATH_ENV, ENV_PREFIX};
use idlegpu_core::Config as CoreConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Complete configuration for the idlegpu agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Scheduling subsystem configuration
    #[serde(flatten)]
    pub core: CoreConfig,

    /// Agent-specific configuration
    pub agent: AgentSpecificConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// HTTP and websocket surface
    pub http: HttpConfig,
}

/// Agent-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpecificConfig {
    /// Agent name/identifier
    pub name: String,

    /// PID file location
    pub pid_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Serve the status API and websocket endpoint
    pub enabled: bool,

    /// Bind address
    pub bind_addr: SocketAddr,

    /// Allow cross-origin requests from browser clients
    pub enable_cors: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            agent: AgentSpecificConfig::default(),
            logging: LoggingConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for AgentSpecificConfig {
    fn default() -> Self {
        Self {
            name: "idlegpud".to_string(),
            pid_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
        }
    }
}

impl AgentConfig {
    /// Load configuration with precedence environment > file > defaults.
    ///
    /// An explicit `path` wins over `IDLEGPU_CONFIG`; without either the
    /// usual locations are tried and may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&Self::default()).map_err(idlegpu_core::Error::from)?,
        );

        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        if let Some(path) = explicit {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            for candidate in &["./idlegpu.yaml", "/etc/idlegpu/config.yaml"] {
                builder = builder.add_source(config::File::with_name(candidate).required(false));
            }
        }

        // IDLEGPU_HTTP__BIND_ADDR=0.0.0.0:8080
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AgentConfig = builder
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| AgentError::Config(format!("Failed to load config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from a file layered over the defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let defaults =
            config::Config::try_from(&Self::default()).map_err(idlegpu_core::Error::from)?;

        config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path.as_ref()))
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| AgentError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_yaml()?;

        std::fs::write(path, content)
            .map_err(|e| AgentError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| AgentError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.core
            .validate()
            .map_err(|e| AgentError::Config(format!("Core config validation failed: {}", e)))?;

        if self.agent.name.is_empty() {
            return Err(AgentError::Config("Agent name cannot be empty".to_string()));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(AgentError::Config(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(AgentError::Config(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Get the PID file path
    pub fn pid_file_path(&self) -> Option<&PathBuf> {
        self.agent.pid_file.as_ref()
    }
}
