//! Documents and chunks handled by background indexing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A source document waiting to be indexed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier for the document
    pub doc_id: String,

    /// Kind of source (transcript, pdf, markdown, ...)
    pub source_type: String,

    /// Filesystem path of the source, if any
    pub source_path: Option<PathBuf>,

    /// Free-form metadata and tags
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a document with no source path
    pub fn new(doc_id: impl Into<String>, source_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            doc_id: doc_id.into(),
            source_type: source_type.into(),
            source_path: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach the filesystem path the content is read from
    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One embedded slice of a document, ready for the vector store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub doc_id: String,
    /// Position of the chunk within its document
    pub chunk_index: usize,
    pub text: String,
    /// Identifier used in the vector store (`<doc_id>:<chunk_index>`)
    pub vector_id: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl DocumentChunk {
    pub fn new(doc_id: &str, chunk_index: usize, text: String, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            chunk_id: format!("chunk-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8]),
            doc_id: doc_id.to_string(),
            chunk_index,
            text,
            vector_id: format!("{}:{}", doc_id, chunk_index),
            embedding,
            created_at: now,
        }
    }
}
