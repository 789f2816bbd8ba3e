//! # idlegpu-monitor
//!
//! Accelerator telemetry for idlegpu.
//!
//! This crate provides:
//! - An [`AcceleratorProbe`] trait with one implementation per telemetry backend
//! - The [`ResourceMonitor`], a background poller exposing the latest
//!   [`ResourceSnapshot`](idlegpu_core::ResourceSnapshot) without blocking
//! - A [`SampleListener`] hook invoked after every successful poll
//!
//! ## Supported Backends
//!
//! - **nvidia-smi**: queries the NVIDIA command line tool
//! - **NVML**: NVIDIA Management Library (`nvml` feature)
//! - **none**: hosts without an accelerator
//!
//! ## Example
//!
//! ```rust,no_run
//! use idlegpu_core::{AcceleratorBackend, MonitorConfig};
//! use idlegpu_monitor::ResourceMonitor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = MonitorConfig::default().with_backend(AcceleratorBackend::NvidiaSmi);
//!     let monitor = ResourceMonitor::new(config).await;
//!
//!     monitor.start();
//!     let snapshot = monitor.snapshot();
//!     println!("GPU available: {}, utilization {:.1}%", snapshot.available, snapshot.utilization);
//!     monitor.stop().await;
//! }
//! ```

use thiserror::Error;

pub mod monitor;
pub mod probe;
pub mod smi;

#[cfg(feature = "nvml")]
pub mod nvml;

// Mock implementation for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use monitor::{ResourceMonitor, SampleListener};
pub use probe::{create_probe, AcceleratorProbe, ProbeSample};
pub use smi::SmiProbe;

/// Result type for probe operations
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Errors that can occur while sampling the accelerator
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Accelerator backend not supported: {0}")]
    UnsupportedBackend(String),

    #[error("Accelerator unavailable: {0}")]
    Unavailable(String),

    #[error("Telemetry command failed: {0}")]
    Command(String),

    #[error("Failed to parse telemetry output: {0}")]
    Parse(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Check if the next poll might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProbeError::Command(_)
                | ProbeError::Parse(_)
                | ProbeError::Timeout(_)
                | ProbeError::Io(_)
        )
    }
}
