//! One file per document, replaced atomically on every save.
//!
//! File layout:
//! ```text
//! <dir>/<uuid-v5(document id)>.doc
//!
//!   lz4( bincode( StoredDocument { id, version, saved_at_ms, content_json } ) )
//! ```
//!
//! Writes go to `<name>.tmp`, are fsynced, then renamed over the old file.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use scrivener_delta::Content;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DocumentStore, SaveRecord, StoreError};
use crate::protocol::DocumentId;

/// Namespace for deriving file names from document ids.
const DOCUMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_8a3b_5d70_9e21_c4b8_a0f3_7d12);

const EXTENSION: &str = "doc";

/// On-disk record. Content is kept as its JSON delta form.
#[derive(Serialize, Deserialize)]
struct StoredDocument {
    id: String,
    version: u64,
    saved_at_ms: u64,
    content_json: Vec<u8>,
}

/// Directory-backed [`DocumentStore`].
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if missing) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        log::info!("File store opened at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for `id`.
    pub fn document_path(&self, id: &DocumentId) -> PathBuf {
        let name = Uuid::new_v5(&DOCUMENT_NAMESPACE, id.as_str().as_bytes());
        self.dir.join(format!("{name}.{EXTENSION}"))
    }

    fn read_record(path: &Path) -> Result<SaveRecord, StoreError> {
        let compressed = fs::read(path)?;
        decode_record(&compressed)
    }
}

fn encode_record(record: &SaveRecord) -> Result<Vec<u8>, StoreError> {
    let content_json = serde_json::to_vec(&record.content)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let stored = StoredDocument {
        id: record.id.as_str().to_string(),
        version: record.version,
        saved_at_ms: record.saved_at_ms,
        content_json,
    };
    let bytes = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

fn decode_record(compressed: &[u8]) -> Result<SaveRecord, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (stored, _): (StoredDocument, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    let id = DocumentId::new(stored.id).map_err(|e| StoreError::Deserialization(e.to_string()))?;
    let content: Content = serde_json::from_slice(&stored.content_json)
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(SaveRecord {
        id,
        content,
        saved_at_ms: stored.saved_at_ms,
        version: stored.version,
    })
}

impl DocumentStore for FileStore {
    fn load(&self, id: &DocumentId) -> Result<SaveRecord, StoreError> {
        let path = self.document_path(id);
        let record = match Self::read_record(&path) {
            Ok(record) => record,
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()))
            }
            Err(e) => return Err(e),
        };
        if &record.id != id {
            return Err(StoreError::Deserialization(format!(
                "{} holds document {}, expected {id}",
                path.display(),
                record.id
            )));
        }
        Ok(record)
    }

    fn save(
        &self,
        id: &DocumentId,
        content: &Content,
        version: u64,
    ) -> Result<SaveRecord, StoreError> {
        let record = SaveRecord::new(id.clone(), content.clone(), version);
        let encoded = encode_record(&record)?;

        let path = self.document_path(id);
        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        log::debug!(
            "Saved {id} v{version}: {} positions, {} bytes on disk",
            content.len(),
            encoded.len()
        );
        Ok(record)
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => ids.push(record.id),
                Err(e) => log::warn!("Skipping unreadable {}: {e}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
