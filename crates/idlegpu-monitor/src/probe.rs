//! Accelerator probe interface and backend selection

use crate::{ProbeError, Result};
use async_trait::async_trait;
use idlegpu_core::{AcceleratorBackend, MonitorConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// One raw reading from the accelerator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    /// Utilization percentage (0-100)
    pub utilization: f64,
    /// Memory in use (bytes)
    pub memory_used: u64,
    /// Total memory (bytes)
    pub memory_total: u64,
}

/// Trait implemented by every telemetry backend
#[async_trait]
pub trait AcceleratorProbe: Send + Sync {
    /// Take one reading of the watched device
    async fn sample(&self) -> Result<ProbeSample>;

    /// Backend name for logging
    fn backend(&self) -> AcceleratorBackend;
}

/// Create the probe for the configured backend.
///
/// `Ok(None)` means the host is configured without an accelerator.
pub async fn create_probe(config: &MonitorConfig) -> Result<Option<Arc<dyn AcceleratorProbe>>> {
    info!("Creating accelerator probe for backend: {}", config.backend);

    match config.backend {
        AcceleratorBackend::None => Ok(None),

        AcceleratorBackend::NvidiaSmi => {
            let probe: Arc<dyn AcceleratorProbe> =
                Arc::new(crate::smi::SmiProbe::new(config.clone()).await?);
            Ok(Some(probe))
        }

        #[cfg(feature = "nvml")]
        AcceleratorBackend::Nvml => {
            let probe: Arc<dyn AcceleratorProbe> =
                Arc::new(crate::nvml::NvmlProbe::new(config.clone())?);
            Ok(Some(probe))
        }

        #[cfg(any(feature = "mock", test))]
        AcceleratorBackend::Mock => {
            let probe: Arc<dyn AcceleratorProbe> = Arc::new(crate::mock::MockProbe::idle());
            Ok(Some(probe))
        }

        #[allow(unreachable_patterns)]
        _ => {
            warn!("Accelerator backend {} not supported or feature not enabled", config.backend);
            Err(ProbeError::UnsupportedBackend(config.backend.to_string()))
        }
    }
}
