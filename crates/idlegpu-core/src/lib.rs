//! # idlegpu-core
//!
//! Core types and utilities for idlegpu - a scheduler that shares one GPU
//! between interactive inference and deferred background indexing.
//!
//! This crate provides the foundational data structures that are shared
//! across the other idlegpu components. It includes:
//!
//! - Accelerator snapshots and workload kinds
//! - Status events pushed to live observers
//! - Documents and chunks handled by background indexing
//! - Configuration schema and parsing utilities
//! - Configuration error types

pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod types;

// Re-export commonly used types at the crate root
pub use crate::config::{Config, IndexingConfig, MonitorConfig, SchedulerConfig, WorkloadConfig};
pub use document::{Document, DocumentChunk};
pub use error::{Error, Result};
pub use events::{GpuStatusPayload, StatusEvent};
pub use types::{AcceleratorBackend, ResourceSnapshot, WorkloadKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bytes per mebibyte, the unit accelerator tools report memory in
pub const BYTES_PER_MIB: u64 = 1024 * 1024;
