//! Background indexing collaborators
//!
//! The scheduler only decides *when* indexing runs. The work itself is done
//! by an [`IndexingTask`] over documents supplied by a [`DocumentStore`],
//! with finished chunks written to a [`VectorSink`].

use crate::slots::WorkloadHandle;
use crate::{AgentError, Result};

use async_trait::async_trait;
use idlegpu_core::{Document, DocumentChunk};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Rough characters-per-token ratio used for chunk sizing
const CHARS_PER_TOKEN: usize = 4;

/// Cooperative cancellation predicate handed to indexing jobs
#[derive(Clone)]
pub struct CancelCheck(Arc<dyn Fn() -> bool + Send + Sync>);

impl CancelCheck {
    pub fn new(check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    /// A check that never fires
    pub fn never() -> Self {
        Self::new(|| false)
    }

    pub fn is_cancelled(&self) -> bool {
        (self.0)()
    }
}

impl fmt::Debug for CancelCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelCheck").field(&self.is_cancelled()).finish()
    }
}

/// A document that was fully written to the vector sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedDocument {
    pub doc_id: String,
    pub chunks: usize,
}

/// Outcome of one indexing job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexingReport {
    pub indexed: Vec<IndexedDocument>,
    pub failed: Vec<String>,
    pub cancelled: bool,
}

impl IndexingReport {
    pub fn documents_completed(&self) -> usize {
        self.indexed.len()
    }

    pub fn chunks_written(&self) -> usize {
        self.indexed.iter().map(|doc| doc.chunks).sum()
    }
}

/// Processes pending documents with the resident embedding workload.
///
/// Implementations must poll `cancel` between units of work and return early
/// once it fires. Partially indexed state is left as is.
#[async_trait]
pub trait IndexingTask: Send + Sync {
    async fn process(
        &self,
        documents: Vec<Document>,
        embedder: &WorkloadHandle,
        cancel: &CancelCheck,
    ) -> Result<IndexingReport>;
}

/// Source of documents waiting to be indexed
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn pending_documents(&self) -> Result<Vec<Document>>;

    async fn mark_indexed(&self, doc_id: &str, chunk_count: usize) -> Result<()>;
}

/// Destination for embedded chunks
#[async_trait]
pub trait VectorSink: Send + Sync {
    /// Insert or replace the chunks of one document
    async fn upsert(&self, document: &Document, chunks: Vec<DocumentChunk>) -> Result<()>;
}

/// Reference indexer: paragraph-aligned chunks embedded one at a time
pub struct ChunkingIndexer {
    sink: Arc<dyn VectorSink>,
    chunk_size: usize,
}

enum DocumentOutcome {
    Complete(Vec<DocumentChunk>),
    Cancelled,
}

impl ChunkingIndexer {
    pub fn new(sink: Arc<dyn VectorSink>, chunk_size: usize) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Split text into chunks of roughly `chunk_size` tokens.
    ///
    /// Paragraphs (separated by blank lines) are never split; a paragraph
    /// larger than the budget becomes a chunk of its own.
    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_size = 0;

        for paragraph in text.split("\n\n") {
            if paragraph.trim().is_empty() {
                continue;
            }
            let size = paragraph.chars().count() / CHARS_PER_TOKEN;

            if current_size + size > self.chunk_size && !current.is_empty() {
                chunks.push(current.join("\n\n"));
                current.clear();
                current_size = 0;
            }
            current.push(paragraph);
            current_size += size;
        }

        if !current.is_empty() {
            chunks.push(current.join("\n\n"));
        }
        chunks
    }

    async fn process_document(
        &self,
        document: &Document,
        embedder: &WorkloadHandle,
        cancel: &CancelCheck,
    ) -> Result<DocumentOutcome> {
        let path = document.source_path.as_ref().ok_or_else(|| {
            AgentError::Indexing(format!("document {} has no source path", document.doc_id))
        })?;
        let content = tokio::fs::read_to_string(path).await?;

        let texts = self.chunk_text(&content);
        debug!("Document {} split into {} chunk(s)", document.doc_id, texts.len());

        let mut chunks = Vec::with_capacity(texts.len());
        for (index, text) in texts.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Cancelling processing of document {}", document.doc_id);
                return Ok(DocumentOutcome::Cancelled);
            }
            let embedding = embedder.embed(&text).await?;
            chunks.push(DocumentChunk::new(&document.doc_id, index, text, embedding));
        }

        Ok(DocumentOutcome::Complete(chunks))
    }
}

#[async_trait]
impl IndexingTask for ChunkingIndexer {
    async fn process(
        &self,
        documents: Vec<Document>,
        embedder: &WorkloadHandle,
        cancel: &CancelCheck,
    ) -> Result<IndexingReport> {
        let mut report = IndexingReport::default();

        for document in documents {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            info!("Processing document: {}", document.doc_id);
            let chunks = match self.process_document(&document, embedder, cancel).await {
                Ok(DocumentOutcome::Complete(chunks)) => chunks,
                Ok(DocumentOutcome::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!("Error processing document {}: {}", document.doc_id, e);
                    report.failed.push(document.doc_id.clone());
                    continue;
                }
            };

            let count = chunks.len();
            if let Err(e) = self.sink.upsert(&document, chunks).await {
                warn!("Error storing chunks for document {}: {}", document.doc_id, e);
                report.failed.push(document.doc_id.clone());
                continue;
            }

            report.indexed.push(IndexedDocument {
                doc_id: document.doc_id.clone(),
                chunks: count,
            });
        }

        Ok(report)
    }
}

/// Documents held in memory, for embedding callers and tests
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<BTreeMap<String, Document>>,
    indexed: RwLock<HashMap<String, usize>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document; a replaced document becomes pending again
    pub fn insert(&self, document: Document) {
        self.indexed.write().remove(&document.doc_id);
        self.documents.write().insert(document.doc_id.clone(), document);
    }

    /// Chunk count recorded for an indexed document
    pub fn indexed_chunks(&self, doc_id: &str) -> Option<usize> {
        self.indexed.read().get(doc_id).copied()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn pending_documents(&self) -> Result<Vec<Document>> {
        let indexed = self.indexed.read();
        Ok(self
            .documents
            .read()
            .values()
            .filter(|doc| !indexed.contains_key(&doc.doc_id))
            .cloned()
            .collect())
    }

    async fn mark_indexed(&self, doc_id: &str, chunk_count: usize) -> Result<()> {
        if !self.documents.read().contains_key(doc_id) {
            return Err(AgentError::Indexing(format!("unknown document {}", doc_id)));
        }
        self.indexed.write().insert(doc_id.to_string(), chunk_count);
        Ok(())
    }
}

/// Files under a directory, pending until indexed and again when modified
pub struct DirectoryDocumentStore {
    root: PathBuf,
    // modification time seen when the document was last listed
    listed: Mutex<HashMap<String, SystemTime>>,
    indexed: Mutex<HashMap<String, SystemTime>>,
}

impl DirectoryDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            listed: Mutex::new(HashMap::new()),
            indexed: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn scan(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        let mut files = Vec::new();
        let mut pending_dirs = vec![self.root.clone()];

        while let Some(dir) = pending_dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending_dirs.push(entry.path());
                } else if file_type.is_file() {
                    let modified = entry.metadata().await?.modified()?;
                    files.push((entry.path(), modified));
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn doc_id_for(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

fn source_type_for(path: &Path) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("md") | Some("markdown") => "markdown".to_string(),
        Some("txt") | None => "text".to_string(),
        Some(other) => other.to_ascii_lowercase(),
    }
}

#[async_trait]
impl DocumentStore for DirectoryDocumentStore {
    async fn pending_documents(&self) -> Result<Vec<Document>> {
        let files = self.scan().await?;

        let mut listed = HashMap::with_capacity(files.len());
        let mut pending = Vec::new();
        {
            let indexed = self.indexed.lock();
            for (path, modified) in files {
                let doc_id = self.doc_id_for(&path);
                let stale = indexed
                    .get(&doc_id)
                    .map(|indexed_at| modified > *indexed_at)
                    .unwrap_or(true);

                listed.insert(doc_id.clone(), modified);
                if stale {
                    let source_type = source_type_for(&path);
                    pending.push(Document::new(doc_id, source_type).with_source_path(path));
                }
            }
        }
        *self.listed.lock() = listed;

        debug!("{} document(s) pending under {}", pending.len(), self.root.display());
        Ok(pending)
    }

    async fn mark_indexed(&self, doc_id: &str, chunk_count: usize) -> Result<()> {
        let modified = self
            .listed
            .lock()
            .get(doc_id)
            .copied()
            .ok_or_else(|| AgentError::Indexing(format!("document {} was not listed", doc_id)))?;

        self.indexed.lock().insert(doc_id.to_string(), modified);
        debug!("Marked {} indexed ({} chunks)", doc_id, chunk_count);
        Ok(())
    }
}

/// Vector entry as stored by [`InMemoryVectorSink`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredVector {
    pub doc_id: String,
    pub chunk_index: usize,
    pub source_type: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Vector sink keeping everything in memory
#[derive(Default)]
pub struct InMemoryVectorSink {
    entries: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryVectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, vector_id: &str) -> Option<StoredVector> {
        self.entries.read().get(vector_id).cloned()
    }

    /// Stored chunks of one document, in chunk order
    pub fn chunks_for(&self, doc_id: &str) -> Vec<StoredVector> {
        let mut chunks: Vec<StoredVector> = self
            .entries
            .read()
            .values()
            .filter(|entry| entry.doc_id == doc_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|entry| entry.chunk_index);
        chunks
    }
}

#[async_trait]
impl VectorSink for InMemoryVectorSink {
    async fn upsert(&self, document: &Document, chunks: Vec<DocumentChunk>) -> Result<()> {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.doc_id != document.doc_id);
        for chunk in chunks {
            entries.insert(
                chunk.vector_id,
                StoredVector {
                    doc_id: chunk.doc_id,
                    chunk_index: chunk.chunk_index,
                    source_type: document.source_type.clone(),
                    text: chunk.text,
                    embedding: chunk.embedding,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLoader;
    use crate::slots::WorkloadSlotManager;
    use idlegpu_core::WorkloadKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn embedder() -> WorkloadHandle {
        let manager = WorkloadSlotManager::new(Arc::new(MockLoader::new()));
        manager.acquire(WorkloadKind::Embedding, "mpnet").await.unwrap()
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_chunk_text_packs_paragraphs() {
        let indexer = ChunkingIndexer::new(Arc::new(InMemoryVectorSink::new()), 10);
        // 20 chars = 5 tokens each
        let para = "a".repeat(20);
        let text = [para.as_str(); 5].join("\n\n");

        let chunks = indexer.chunk_text(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], format!("{}\n\n{}", para, para));
        assert_eq!(chunks[2], para);
    }

    #[test]
    fn test_chunk_text_oversized_paragraph_stands_alone() {
        let indexer = ChunkingIndexer::new(Arc::new(InMemoryVectorSink::new()), 10);
        let big = "b".repeat(400);
        let text = format!("short\n\n{}\n\nshort", big);

        let chunks = indexer.chunk_text(&text);
        assert_eq!(chunks, vec!["short".to_string(), big, "short".to_string()]);
    }

    #[test]
    fn test_chunk_text_empty() {
        let indexer = ChunkingIndexer::new(Arc::new(InMemoryVectorSink::new()), 500);
        assert!(indexer.chunk_text("").is_empty());
        assert!(indexer.chunk_text("\n\n\n\n").is_empty());
    }

    #[tokio::test]
    async fn test_indexer_writes_chunks() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "notes.md", "first paragraph\n\nsecond paragraph");
        let sink = Arc::new(InMemoryVectorSink::new());
        let indexer = ChunkingIndexer::new(sink.clone(), 2);

        let docs = vec![Document::new("notes", "markdown").with_source_path(path)];
        let report = indexer.process(docs, &embedder().await, &CancelCheck::never()).await.unwrap();

        assert_eq!(report.documents_completed(), 1);
        assert_eq!(report.chunks_written(), 2);
        assert!(!report.cancelled);

        let chunks = sink.chunks_for("notes");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "first paragraph");
        assert_eq!(chunks[0].source_type, "markdown");
        assert!(sink.get("notes:1").is_some());
    }

    #[tokio::test]
    async fn test_indexer_skips_failed_documents() {
        let dir = TempDir::new().unwrap();
        let good = write(&dir, "good.txt", "content");
        let sink = Arc::new(InMemoryVectorSink::new());
        let indexer = ChunkingIndexer::new(sink.clone(), 500);

        let docs = vec![
            Document::new("missing", "text").with_source_path(dir.path().join("nope.txt")),
            Document::new("no-path", "text"),
            Document::new("good", "text").with_source_path(good),
        ];
        let report = indexer.process(docs, &embedder().await, &CancelCheck::never()).await.unwrap();

        assert_eq!(report.failed, vec!["missing".to_string(), "no-path".to_string()]);
        assert_eq!(report.documents_completed(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_indexer_stops_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let text = ["one", "two", "three", "four"].join("\n\n");
        let first = write(&dir, "a.txt", &text);
        let second = write(&dir, "b.txt", &text);
        let sink = Arc::new(InMemoryVectorSink::new());
        let indexer = ChunkingIndexer::new(sink.clone(), 1);

        // fires on the third check, before the second chunk of the first document
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let cancel = CancelCheck::new(move || counter.fetch_add(1, Ordering::SeqCst) >= 2);

        let docs = vec![
            Document::new("a", "text").with_source_path(first),
            Document::new("b", "text").with_source_path(second),
        ];
        let report = indexer.process(docs, &embedder().await, &cancel).await.unwrap();

        assert!(report.cancelled);
        assert!(report.indexed.is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_indexer_cancelled_before_start() {
        let sink = Arc::new(InMemoryVectorSink::new());
        let indexer = ChunkingIndexer::new(sink, 500);
        let cancel = CancelCheck::new(|| true);

        let docs = vec![Document::new("a", "text")];
        let report = indexer.process(docs, &embedder().await, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryDocumentStore::new();
        store.insert(Document::new("b", "text"));
        store.insert(Document::new("a", "text"));

        let pending = store.pending_documents().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].doc_id, "a");

        store.mark_indexed("a", 3).await.unwrap();
        assert_eq!(store.indexed_chunks("a"), Some(3));
        assert_eq!(store.pending_documents().await.unwrap().len(), 1);
        assert!(store.mark_indexed("zzz", 1).await.is_err());

        store.insert(Document::new("a", "text"));
        assert_eq!(store.pending_documents().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_directory_store() {
        let dir = TempDir::new().unwrap();
        write(&dir, "notes.md", "hello");
        write(&dir, "nested/call.txt", "transcript");

        let store = DirectoryDocumentStore::new(dir.path());
        let pending = store.pending_documents().await.unwrap();
        assert_eq!(pending.len(), 2);

        let ids: Vec<&str> = pending.iter().map(|d| d.doc_id.as_str()).collect();
        assert!(ids.contains(&"notes.md"));
        assert!(ids.contains(&"nested/call.txt"));

        let notes = pending.iter().find(|d| d.doc_id == "notes.md").unwrap();
        assert_eq!(notes.source_type, "markdown");
        assert!(notes.source_path.as_ref().unwrap().ends_with("notes.md"));

        store.mark_indexed("notes.md", 1).await.unwrap();
        let pending = store.pending_documents().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].doc_id, "nested/call.txt");

        assert!(store.mark_indexed("never-listed", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_directory_store_modified_file_is_pending_again() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "notes.md", "hello");

        let store = DirectoryDocumentStore::new(dir.path());
        store.pending_documents().await.unwrap();
        store.mark_indexed("notes.md", 1).await.unwrap();
        assert!(store.pending_documents().await.unwrap().is_empty());

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + std::time::Duration::from_secs(60))
            .unwrap();

        let pending = store.pending_documents().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].doc_id, "notes.md");
    }

    #[tokio::test]
    async fn test_directory_store_missing_root() {
        let store = DirectoryDocumentStore::new("/nonexistent/idlegpu-docs");
        assert!(store.pending_documents().await.is_err());
    }

    #[test]
    fn test_source_type_for() {
        assert_eq!(source_type_for(Path::new("a.md")), "markdown");
        assert_eq!(source_type_for(Path::new("a.txt")), "text");
        assert_eq!(source_type_for(Path::new("README")), "text");
        assert_eq!(source_type_for(Path::new("call.VTT")), "vtt");
    }
}
