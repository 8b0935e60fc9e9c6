//! RocksDB-backed storage.
//!
//! Column families:
//! - `documents` — JSON [`StoredDoc`] bodies (LZ4 compressed), keyed by `collection \x1f doc_id`
//! - `metadata`  — bincode [`DocumentMetadata`] under the same key
//!
//! Compare-and-swap is enforced by serializing `save_doc` behind a write
//! lock; the read of the stored version and the batch write happen under it.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use replica_core::VersionVector;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{check_version, Storage, StorageError, StoredDoc};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Separates collection name from doc id in keys.
const KEY_SEPARATOR: u8 = 0x1f;

/// RocksDB configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("replica_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Serialized version vector of the stored body
    pub version: String,
    pub op_count: u64,
    /// Uncompressed body size in bytes
    pub body_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: StorageConfig,
    /// Serializes compare-and-swap writes
    write_lock: Mutex<()>,
}

impl RocksStorage {
    /// Open (or create) the database at the configured path.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened RocksDB storage at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StorageConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Bodies are LZ4-compressed before they get here
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Metadata for one document, if stored.
    pub fn load_metadata(&self, collection_name: &str, doc_id: &str) -> Result<Option<DocumentMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_key(collection_name, doc_id))? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, key: &[u8]) -> Result<Option<StoredDoc>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, key)? {
            Some(compressed) => decode_body(&compressed).map(Some),
            None => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl Storage for RocksStorage {
    async fn init(&self) -> Result<(), StorageError> {
        for name in COLUMN_FAMILIES {
            self.cf(name)?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        let mut batch = WriteBatch::default();
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, &key);
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_doc_by_id(&self, collection_name: &str, doc_id: &str) -> Result<Option<StoredDoc>, StorageError> {
        self.load(&doc_key(collection_name, doc_id))
    }

    async fn get_docs(&self, collection_name: &str) -> Result<Vec<StoredDoc>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let prefix = collection_prefix(collection_name);
        let mut docs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            docs.push(decode_body(&value)?);
        }
        Ok(docs)
    }

    async fn save_doc(
        &self,
        collection_name: &str,
        doc: &StoredDoc,
        prev_version: Option<&VersionVector>,
    ) -> Result<(), StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = doc_key(collection_name, &doc.id);

        let body = serde_json::to_vec(doc).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&body);
        let meta = DocumentMetadata {
            version: doc.version.to_string(),
            op_count: doc.ops.len() as u64,
            body_size: body.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        let stored = self.load(&key)?;
        check_version(stored.as_ref(), prev_version)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, &key, &compressed);
        batch.put_cf(cf_meta, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn collection_prefix(collection_name: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(collection_name.len() + 1);
    prefix.extend_from_slice(collection_name.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn doc_key(collection_name: &str, doc_id: &str) -> Vec<u8> {
    let mut key = collection_prefix(collection_name);
    key.extend_from_slice(doc_id.as_bytes());
    key
}

fn decode_body(compressed: &[u8]) -> Result<StoredDoc, StorageError> {
    let body = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StorageError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
