//! Core type definitions for idlegpu

use crate::BYTES_PER_MIB;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time view of accelerator load.
///
/// Snapshots are immutable and carry no identity beyond recency: every
/// successful poll supersedes the previous one. A host without a usable
/// accelerator is represented by `available == false`, never by an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Utilization percentage (0-100)
    pub utilization: f64,

    /// Memory in use (bytes)
    pub memory_used: u64,

    /// Total memory (bytes)
    pub memory_total: u64,

    /// Whether the accelerator could be queried at all
    pub available: bool,

    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Zeroed snapshot reported when no accelerator is present
    pub fn unavailable() -> Self {
        Self {
            utilization: 0.0,
            memory_used: 0,
            memory_total: 0,
            available: false,
            sampled_at: Utc::now(),
        }
    }

    /// Snapshot for a successful sample taken now
    pub fn sampled(utilization: f64, memory_used: u64, memory_total: u64) -> Self {
        let utilization = if utilization.is_finite() {
            utilization.clamp(0.0, 100.0)
        } else {
            0.0
        };

        Self {
            utilization,
            memory_used,
            memory_total,
            available: true,
            sampled_at: Utc::now(),
        }
    }

    /// Memory in use as a percentage of total, 0 when total is unknown
    pub fn memory_used_percent(&self) -> f64 {
        if self.memory_total == 0 {
            return 0.0;
        }
        (self.memory_used as f64 / self.memory_total as f64) * 100.0
    }

    /// Memory in use in MiB
    pub fn memory_used_mib(&self) -> f64 {
        self.memory_used as f64 / BYTES_PER_MIB as f64
    }

    /// Total memory in MiB
    pub fn memory_total_mib(&self) -> f64 {
        self.memory_total as f64 / BYTES_PER_MIB as f64
    }

    /// Age of the sample relative to now
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.sampled_at
    }
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// Kind of heavy resource that can occupy the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    /// Interactive chat model
    Conversational,
    /// Embedding model used by background indexing
    Embedding,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Conversational => write!(f, "conversational"),
            WorkloadKind::Embedding => write!(f, "embedding"),
        }
    }
}

impl std::str::FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conversational" | "chat" => Ok(WorkloadKind::Conversational),
            "embedding" | "embedder" => Ok(WorkloadKind::Embedding),
            _ => Err(format!("Unknown workload kind: {}", s)),
        }
    }
}

/// Accelerator telemetry backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcceleratorBackend {
    /// Query the `nvidia-smi` command line tool
    NvidiaSmi,
    /// NVIDIA Management Library
    Nvml,
    /// No accelerator; every snapshot is unavailable
    None,
    /// Scripted backend for testing
    Mock,
}

impl fmt::Display for AcceleratorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorBackend::NvidiaSmi => write!(f, "nvidia-smi"),
            AcceleratorBackend::Nvml => write!(f, "nvml"),
            AcceleratorBackend::None => write!(f, "none"),
            AcceleratorBackend::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for AcceleratorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nvidia-smi" | "smi" => Ok(AcceleratorBackend::NvidiaSmi),
            "nvml" => Ok(AcceleratorBackend::Nvml),
            "none" => Ok(AcceleratorBackend::None),
            "mock" => Ok(AcceleratorBackend::Mock),
            _ => Err(format!("Unknown accelerator backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_snapshot() {
        let snapshot = ResourceSnapshot::unavailable();
        assert!(!snapshot.available);
        assert_eq!(snapshot.utilization, 0.0);
        assert_eq!(snapshot.memory_total, 0);
        assert_eq!(snapshot.memory_used_percent(), 0.0);
    }

    #[test]
    fn test_sampled_snapshot() {
        let snapshot = ResourceSnapshot::sampled(42.5, 2 * BYTES_PER_MIB, 8 * BYTES_PER_MIB);
        assert!(snapshot.available);
        assert_eq!(snapshot.utilization, 42.5);
        assert_eq!(snapshot.memory_used_percent(), 25.0);
        assert_eq!(snapshot.memory_used_mib(), 2.0);
        assert_eq!(snapshot.memory_total_mib(), 8.0);
    }

    #[test]
    fn test_sampled_snapshot_clamps_utilization() {
        assert_eq!(ResourceSnapshot::sampled(140.0, 0, 0).utilization, 100.0);
        assert_eq!(ResourceSnapshot::sampled(-3.0, 0, 0).utilization, 0.0);
        assert_eq!(ResourceSnapshot::sampled(f64::NAN, 0, 0).utilization, 0.0);
    }

    #[test]
    fn test_workload_kind_parsing() {
        assert_eq!(
            "conversational".parse::<WorkloadKind>().unwrap(),
            WorkloadKind::Conversational
        );
        assert_eq!("Embedding".parse::<WorkloadKind>().unwrap(), WorkloadKind::Embedding);
        assert!("vision".parse::<WorkloadKind>().is_err());
        assert_eq!(WorkloadKind::Embedding.to_string(), "embedding");
    }

    #[test]
    fn test_accelerator_backend_parsing() {
        assert_eq!(
            "nvidia-smi".parse::<AcceleratorBackend>().unwrap(),
            AcceleratorBackend::NvidiaSmi
        );
        assert_eq!("nvml".parse::<AcceleratorBackend>().unwrap(), AcceleratorBackend::Nvml);
        assert_eq!("none".parse::<AcceleratorBackend>().unwrap(), AcceleratorBackend::None);
        assert!("rocm".parse::<AcceleratorBackend>().is_err());
    }

    #[test]
    fn test_accelerator_backend_serde() {
        let json = serde_json::to_string(&AcceleratorBackend::NvidiaSmi).unwrap();
        assert_eq!(json, "\"nvidia-smi\"");
        let parsed: AcceleratorBackend = serde_json::from_str("\"mock\"").unwrap();
        assert_eq!(parsed, AcceleratorBackend::Mock);
    }
}
