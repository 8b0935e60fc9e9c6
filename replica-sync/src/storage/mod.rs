//! Persistence contract and backends.
//!
//! ```text
//! ┌─────────────┐  get_doc_by_id / get_docs_by_query  ┌───────────────┐
//! │ ServerDoc   │ ──────────────────────────────────► │ dyn Storage   │
//! │ ServerQuery │  save_doc(doc, prev_version) (CAS)  │               │
//! └─────────────┘ ──────────────────────────────────► ├───────────────┤
//!                                                      │ MemoryStorage │
//!                                                      │ RocksStorage  │
//!                                                      └───────────────┘
//! ```
//!
//! `save_doc` must compare the stored version with `prev_version` and write
//! atomically; a mismatch fails with [`StorageError::StaleData`].

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use replica_core::{evaluate, Document, Operation, QueryOutput, VersionVector, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryStorage;
pub use rocks::{DocumentMetadata, RocksStorage, StorageConfig};

/// Persisted form of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDoc {
    pub id: String,
    /// Folded state without `_id`; `None` when deleted or never created
    pub state: Option<Value>,
    #[serde(default)]
    pub deleted: bool,
    pub version: VersionVector,
    pub ops: Vec<Operation>,
}

impl StoredDoc {
    pub fn from_document(doc: &Document) -> Self {
        let state = doc.get().map(|mut s| {
            if let Value::Object(map) = &mut s {
                map.remove(ID_FIELD);
            }
            s
        });
        Self {
            id: doc.doc_id().to_string(),
            state,
            deleted: doc.is_deleted(),
            version: doc.version(),
            ops: doc.ops().to_vec(),
        }
    }

    /// Rebuild the document by replaying the stored log.
    pub fn to_document(&self, collection_name: &str) -> Document {
        Document::from_ops(collection_name, &self.id, self.ops.iter().cloned())
    }

    /// State with `_id`, as seen by queries. `None` for deleted documents.
    pub fn snapshot(&self) -> Option<Value> {
        if self.deleted {
            return None;
        }
        let mut state = self.state.clone()?;
        if let Value::Object(map) = &mut state {
            map.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        }
        Some(state)
    }
}

/// Result of [`Storage::get_docs_by_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Matching documents in result order
    Docs(Vec<StoredDoc>),
    /// Count, distinct list or aggregate
    Value(Value),
}

impl QueryResult {
    pub fn ids(&self) -> Vec<String> {
        match self {
            QueryResult::Docs(docs) => docs.iter().map(|d| d.id.clone()).collect(),
            QueryResult::Value(_) => Vec::new(),
        }
    }
}

/// Evaluate `expression` over a collection scan.
pub fn run_query(expression: &Value, docs: Vec<StoredDoc>) -> QueryResult {
    let snapshots: Vec<Value> = docs.iter().filter_map(StoredDoc::snapshot).collect();
    match evaluate(expression, snapshots) {
        QueryOutput::Docs(results) => {
            let mut by_id: std::collections::HashMap<String, StoredDoc> =
                docs.into_iter().map(|d| (d.id.clone(), d)).collect();
            QueryResult::Docs(
                results
                    .iter()
                    .filter_map(replica_core::query::doc_id)
                    .filter_map(|id| by_id.remove(&id))
                    .collect(),
            )
        }
        QueryOutput::Value(v) => QueryResult::Value(v),
    }
}

/// `prev_version` check shared by backends. `None` means "must not exist yet".
pub fn check_version(stored: Option<&StoredDoc>, prev_version: Option<&VersionVector>) -> Result<(), StorageError> {
    let current = stored.map(|d| &d.version).filter(|v| !v.is_empty());
    let expected = prev_version.filter(|v| !v.is_empty());
    if current == expected {
        Ok(())
    } else {
        Err(StorageError::StaleData)
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn init(&self) -> Result<(), StorageError>;

    /// Drop every document.
    async fn clear(&self) -> Result<(), StorageError>;

    async fn get_doc_by_id(&self, collection_name: &str, doc_id: &str) -> Result<Option<StoredDoc>, StorageError>;

    /// Every document of a collection, deleted ones included.
    async fn get_docs(&self, collection_name: &str) -> Result<Vec<StoredDoc>, StorageError>;

    async fn get_docs_by_query(&self, collection_name: &str, expression: &Value) -> Result<QueryResult, StorageError> {
        let docs = self.get_docs(collection_name).await?;
        Ok(run_query(expression, docs))
    }

    /// Compare-and-swap write conditioned on `prev_version`.
    async fn save_doc(
        &self,
        collection_name: &str,
        doc: &StoredDoc,
        prev_version: Option<&VersionVector>,
    ) -> Result<(), StorageError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// `prev_version` no longer matches the stored version
    StaleData,
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::StaleData => write!(f, "stale data"),
            StorageError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StorageError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StorageError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StorageError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StorageError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::IoError(e.to_string())
    }
}
