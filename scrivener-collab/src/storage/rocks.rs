//! RocksDB-backed document store (cargo feature `rocksdb`).
//!
//! Column families, both keyed by the document id bytes:
//! - `documents`: latest content snapshot (JSON delta, LZ4 compressed)
//! - `metadata`: [`DocumentMetadata`] (bincode)
//!
//! Snapshot and metadata are written in one atomic batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use scrivener_delta::Content;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{now_ms, DocumentStore, SaveRecord, StoreError};
use crate::protocol::DocumentId;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync every write batch
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scrivener_rocks"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored next to each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub version: u64,
    pub saved_at_ms: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
}

impl DocumentMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed [`DocumentStore`].
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    config: RocksConfig,
}

impl RocksStore {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("RocksDB store opened at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_max_write_buffer_number(2);

        match name {
            // Snapshots are already LZ4 compressed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    pub fn load_metadata(&self, id: &DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, id.as_str().as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn load(&self, id: &DocumentId) -> Result<SaveRecord, StoreError> {
        let meta = self.load_metadata(id)?;
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, id.as_str().as_bytes())?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let content: Content = serde_json::from_slice(&json)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        Ok(SaveRecord {
            id: id.clone(),
            content,
            saved_at_ms: meta.saved_at_ms,
            version: meta.version,
        })
    }

    fn save(
        &self,
        id: &DocumentId,
        content: &Content,
        version: u64,
    ) -> Result<SaveRecord, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json =
            serde_json::to_vec(content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);
        let meta = DocumentMetadata {
            id: id.as_str().to_string(),
            version,
            saved_at_ms: now_ms(),
            snapshot_size: json.len() as u64,
            compressed_size: compressed.len() as u64,
        };

        let key = id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(SaveRecord {
            id: id.clone(),
            content: content.clone(),
            saved_at_ms: meta.saved_at_ms,
            version,
        })
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let id =
                DocumentId::new(name).map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }
}
