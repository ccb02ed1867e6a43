//! Durable document state.
//!
//! ```text
//! ┌───────────────┐  save(id, content, version)  ┌────────────────────┐
//! │DocumentSession│ ───────────────────────────► │ dyn DocumentStore  │
//! │ (debounced)   │ ◄─────────────────────────── │  MemoryStore       │
//! └───────────────┘        load(id)              │  FileStore (LZ4)   │
//!                                                │  RocksStore (LZ4)  │
//!                                                └────────────────────┘
//! ```
//!
//! Stores hold only the latest snapshot per document. Every save replaces
//! the previous snapshot as a whole; a reader never sees a partial write.
//! All methods block, so async callers go through `spawn_blocking`.

pub mod file;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::sync::Arc;
use std::time::SystemTime;

use scrivener_delta::Content;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StorageBackend;
use crate::protocol::DocumentId;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksConfig, RocksStore};

/// The last snapshot written for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRecord {
    pub id: DocumentId,
    pub content: Content,
    /// Milliseconds since the Unix epoch.
    pub saved_at_ms: u64,
    /// Session version the snapshot reflects.
    pub version: u64,
}

impl SaveRecord {
    pub fn new(id: DocumentId, content: Content, version: u64) -> Self {
        Self {
            id,
            content,
            saved_at_ms: now_ms(),
            version,
        }
    }
}

/// Latest-snapshot storage keyed by document id.
pub trait DocumentStore: Send + Sync + 'static {
    /// Load the latest snapshot. [`StoreError::NotFound`] means the document
    /// has never been saved.
    fn load(&self, id: &DocumentId) -> Result<SaveRecord, StoreError>;

    /// Replace the stored snapshot for `id`.
    fn save(&self, id: &DocumentId, content: &Content, version: u64)
        -> Result<SaveRecord, StoreError>;

    /// Ids of every stored document.
    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("storage backend not available: {0}")]
    Unsupported(&'static str),
}

/// Open the store selected by `backend`.
pub fn open_store(backend: &StorageBackend) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::File(dir) => Ok(Arc::new(FileStore::open(dir)?)),
        #[cfg(feature = "rocksdb")]
        StorageBackend::Rocks(path) => Ok(Arc::new(RocksStore::open(RocksConfig {
            path: path.clone(),
            ..RocksConfig::default()
        })?)),
        #[cfg(not(feature = "rocksdb"))]
        StorageBackend::Rocks(_) => Err(StoreError::Unsupported(
            "built without the `rocksdb` feature",
        )),
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
