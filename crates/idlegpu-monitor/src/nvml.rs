//! NVML (NVIDIA Management Library) backend

use crate::probe::{AcceleratorProbe, ProbeSample};
use crate::{ProbeError, Result};

use async_trait::async_trait;
use idlegpu_core::{AcceleratorBackend, MonitorConfig};
use nvml_wrapper::Nvml;
use std::sync::Arc;
use tracing::{debug, info};

/// NVML probe for a single device
pub struct NvmlProbe {
    config: MonitorConfig,
    nvml: Arc<Nvml>,
}

impl NvmlProbe {
    /// Initialize NVML and check that the configured device exists
    pub fn new(config: MonitorConfig) -> Result<Self> {
        info!("Creating NVML probe for device {}", config.device_index);

        let nvml = Nvml::init().map_err(|e| ProbeError::Driver(e.to_string()))?;
        let count = nvml.device_count().map_err(|e| ProbeError::Driver(e.to_string()))?;
        info!("Initialized NVML. Found {} device(s)", count);

        if config.device_index >= count {
            return Err(ProbeError::Unavailable(format!(
                "device {} requested but only {} present",
                config.device_index, count
            )));
        }

        Ok(Self {
            config,
            nvml: Arc::new(nvml),
        })
    }
}

#[async_trait]
impl AcceleratorProbe for NvmlProbe {
    async fn sample(&self) -> Result<ProbeSample> {
        let nvml = Arc::clone(&self.nvml);
        let index = self.config.device_index;

        // NVML calls are blocking FFI
        let sample = tokio::task::spawn_blocking(move || -> Result<ProbeSample> {
            let device = nvml
                .device_by_index(index)
                .map_err(|e| ProbeError::Driver(e.to_string()))?;
            let utilization = device
                .utilization_rates()
                .map_err(|e| ProbeError::Command(e.to_string()))?;
            let memory = device
                .memory_info()
                .map_err(|e| ProbeError::Command(e.to_string()))?;

            Ok(ProbeSample {
                utilization: utilization.gpu as f64,
                memory_used: memory.used,
                memory_total: memory.total,
            })
        })
        .await
        .map_err(|e| ProbeError::Command(format!("NVML sampling task failed: {}", e)))??;

        debug!("NVML sample for device {}: {:?}", index, sample);
        Ok(sample)
    }

    fn backend(&self) -> AcceleratorBackend {
        AcceleratorBackend::Nvml
    }
}
