//! In-process storage.
//!
//! Clones share the same data, so several [`Store`](crate::store::Store)s
//! built on one `MemoryStorage` behave like server processes sharing a
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use replica_core::VersionVector;
use tokio::sync::RwLock;

use super::{check_version, Storage, StorageError, StoredDoc};

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    collections: Arc<RwLock<HashMap<String, BTreeMap<String, StoredDoc>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across all collections.
    pub async fn len(&self) -> usize {
        self.collections.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.collections.write().await.clear();
        Ok(())
    }

    async fn get_doc_by_id(&self, collection_name: &str, doc_id: &str) -> Result<Option<StoredDoc>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection_name).and_then(|c| c.get(doc_id)).cloned())
    }

    async fn get_docs(&self, collection_name: &str) -> Result<Vec<StoredDoc>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection_name)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_doc(
        &self,
        collection_name: &str,
        doc: &StoredDoc,
        prev_version: Option<&VersionVector>,
    ) -> Result<(), StorageError> {
        // Write lock held across compare and write.
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection_name.to_string()).or_default();
        check_version(docs.get(&doc.id), prev_version)?;
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::{Document, OpKind, Operation};
    use serde_json::json;

    fn doc_with(ops: Vec<Operation>) -> StoredDoc {
        StoredDoc::from_document(&Document::from_ops("users", "1", ops))
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = MemoryStorage::new();
        let doc = doc_with(vec![Operation::new(OpKind::Add, "s", 1, "users", "1").with_value(json!({"a": 1}))]);
        storage.save_doc("users", &doc, None).await.unwrap();
        assert_eq!(storage.get_doc_by_id("users", "1").await.unwrap(), Some(doc));
        assert_eq!(storage.get_doc_by_id("users", "2").await.unwrap(), None);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_save_rejected() {
        let storage = MemoryStorage::new();
        let add = Operation::new(OpKind::Add, "s", 1, "users", "1").with_value(json!({}));
        let first = doc_with(vec![add.clone()]);
        storage.save_doc("users", &first, None).await.unwrap();

        let second = doc_with(vec![
            add.clone(),
            Operation::new(OpKind::Set, "a", 2, "users", "1").with_field("x").with_value(json!(1)),
        ]);
        storage.save_doc("users", &second, Some(&first.version)).await.unwrap();

        // A writer still holding the first version loses.
        let third = doc_with(vec![
            add,
            Operation::new(OpKind::Set, "b", 2, "users", "1").with_field("y").with_value(json!(1)),
        ]);
        let err = storage.save_doc("users", &third, Some(&first.version)).await.unwrap_err();
        assert_eq!(err, StorageError::StaleData);
    }

    #[tokio::test]
    async fn test_clones_share_data() {
        let a = MemoryStorage::new();
        let b = a.clone();
        let doc = doc_with(vec![Operation::new(OpKind::Add, "s", 1, "users", "1")]);
        a.save_doc("users", &doc, None).await.unwrap();
        assert!(b.get_doc_by_id("users", "1").await.unwrap().is_some());
        b.clear().await.unwrap();
        assert!(a.is_empty().await);
    }
}
