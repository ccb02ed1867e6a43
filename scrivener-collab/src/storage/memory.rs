//! In-process store. Keeps every write for inspection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use scrivener_delta::Content;

use super::{DocumentStore, SaveRecord, StoreError};
use crate::protocol::DocumentId;

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<DocumentId, SaveRecord>,
    history: Vec<SaveRecord>,
    failed_writes: usize,
    fail_writes: usize,
    fail_loads: usize,
}

/// Map-backed [`DocumentStore`].
///
/// Nothing survives the process. Failures can be injected to exercise the
/// retry paths of the callers.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document as if it had been saved earlier.
    pub fn with_document(self, id: DocumentId, content: Content) -> Self {
        self.lock()
            .documents
            .insert(id.clone(), SaveRecord::new(id, content, 0));
        self
    }

    /// Every successful write, oldest first.
    pub fn writes(&self) -> Vec<SaveRecord> {
        self.lock().history.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().history.len()
    }

    /// Writes rejected by [`fail_next_writes`](Self::fail_next_writes).
    pub fn failed_write_count(&self) -> usize {
        self.lock().failed_writes
    }

    pub fn writes_for(&self, id: &DocumentId) -> Vec<SaveRecord> {
        self.lock()
            .history
            .iter()
            .filter(|record| &record.id == id)
            .cloned()
            .collect()
    }

    /// Make the next `count` saves fail with an I/O error.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().fail_writes = count;
    }

    /// Make the next `count` loads fail with an I/O error.
    pub fn fail_next_loads(&self, count: usize) {
        self.lock().fail_loads = count;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, id: &DocumentId) -> Result<SaveRecord, StoreError> {
        let mut inner = self.lock();
        if inner.fail_loads > 0 {
            inner.fail_loads -= 1;
            return Err(StoreError::Io(std::io::Error::other("injected load failure")));
        }
        inner
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn save(
        &self,
        id: &DocumentId,
        content: &Content,
        version: u64,
    ) -> Result<SaveRecord, StoreError> {
        let mut inner = self.lock();
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            inner.failed_writes += 1;
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        let record = SaveRecord::new(id.clone(), content.clone(), version);
        inner.documents.insert(id.clone(), record.clone());
        inner.history.push(record.clone());
        Ok(record)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.lock().documents.keys().cloned().collect())
    }
}
