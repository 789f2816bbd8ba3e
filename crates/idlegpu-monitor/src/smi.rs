//! `nvidia-smi` backend

use crate::probe::{AcceleratorProbe, ProbeSample};
use crate::{ProbeError, Result};

use async_trait::async_trait;
use idlegpu_core::{AcceleratorBackend, MonitorConfig, BYTES_PER_MIB};
use tokio::process::Command;
use tracing::{debug, info};

const QUERY_FIELDS: &str = "--query-gpu=utilization.gpu,memory.used,memory.total";
const QUERY_FORMAT: &str = "--format=csv,noheader,nounits";

/// Probe that shells out to `nvidia-smi` on every sample
pub struct SmiProbe {
    config: MonitorConfig,
}

impl SmiProbe {
    /// Create the probe and verify that the tool answers for the configured device
    pub async fn new(config: MonitorConfig) -> Result<Self> {
        info!(
            "Creating nvidia-smi probe ({}) for device {}",
            config.nvidia_smi_path, config.device_index
        );

        let probe = Self { config };
        match probe.query().await {
            Ok(sample) => {
                info!(
                    "nvidia-smi probe ready: {:.0}% utilization, {} MiB total",
                    sample.utilization,
                    sample.memory_total / BYTES_PER_MIB
                );
                Ok(probe)
            }
            Err(ProbeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                ProbeError::Unavailable(format!("{} not found", probe.config.nvidia_smi_path)),
            ),
            Err(e) => Err(ProbeError::Unavailable(e.to_string())),
        }
    }

    async fn query(&self) -> Result<ProbeSample> {
        let output = tokio::time::timeout(
            self.config.probe_timeout(),
            Command::new(&self.config.nvidia_smi_path)
                .arg(QUERY_FIELDS)
                .arg(QUERY_FORMAT)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            ProbeError::Timeout(format!(
                "nvidia-smi did not answer within {:?}",
                self.config.probe_timeout()
            ))
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Command(format!(
                "{} exited with {}: {}",
                self.config.nvidia_smi_path,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_smi_output(&stdout, self.config.device_index)
    }
}

#[async_trait]
impl AcceleratorProbe for SmiProbe {
    async fn sample(&self) -> Result<ProbeSample> {
        let sample = self.query().await?;
        debug!(
            "nvidia-smi sample: {:.1}% utilization, {}/{} bytes",
            sample.utilization, sample.memory_used, sample.memory_total
        );
        Ok(sample)
    }

    fn backend(&self) -> AcceleratorBackend {
        AcceleratorBackend::NvidiaSmi
    }
}

/// Parse `utilization, memory.used, memory.total` rows (MiB, no units).
/// One row per device, in device index order.
pub fn parse_smi_output(output: &str, device_index: u32) -> Result<ProbeSample> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .nth(device_index as usize)
        .ok_or_else(|| {
            ProbeError::Unavailable(format!("device {} not reported by nvidia-smi", device_index))
        })?;

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(ProbeError::Parse(format!("expected 3 fields, got {:?}", line)));
    }

    let utilization: f64 = fields[0]
        .parse()
        .map_err(|_| ProbeError::Parse(format!("utilization {:?}", fields[0])))?;
    let memory_used: u64 = fields[1]
        .parse()
        .map_err(|_| ProbeError::Parse(format!("memory.used {:?}", fields[1])))?;
    let memory_total: u64 = fields[2]
        .parse()
        .map_err(|_| ProbeError::Parse(format!("memory.total {:?}", fields[2])))?;

    Ok(ProbeSample {
        utilization,
        memory_used: memory_used * BYTES_PER_MIB,
        memory_total: memory_total * BYTES_PER_MIB,
    })
}
