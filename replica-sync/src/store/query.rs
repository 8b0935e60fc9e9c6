//! Live server-side query.
//!
//! Keyed by `query_hash(base collection, expression)`. Reloaded whenever a
//! document of its collection (or one it joins against) commits; each reload
//! sends subscribers the id-list diff plus the operations of result documents
//! they do not hold yet.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use replica_core::query::{join_refs, resolve_joins};
use replica_core::value::get_path;
use replica_core::{diff_ids, query_hash, JoinRef, QueryKind};
use serde_json::Value;
use tokio::sync::watch;

use super::{Shared, Unattach};
use crate::channel::ChannelId;
use crate::protocol::{Control, Message, QueryDiff, QuerySnapshot};
use crate::storage::{QueryResult, StorageError};

struct QueryState {
    /// `None` until the first load completes
    result: Option<QueryResult>,
    /// Documents referenced through joins
    deps: BTreeSet<(String, String)>,
    loading: bool,
    reload_pending: bool,
    subscribers: HashSet<(ChannelId, String)>,
    generation: u64,
}

pub struct ServerQuery {
    collection_name: String,
    expression: Value,
    kind: QueryKind,
    state: Mutex<QueryState>,
    loaded_tx: watch::Sender<bool>,
}

impl ServerQuery {
    pub(crate) fn new(collection_name: &str, expression: Value) -> Arc<Self> {
        let (loaded_tx, _) = watch::channel(false);
        Arc::new(Self {
            collection_name: collection_name.to_string(),
            kind: QueryKind::of(&expression),
            expression,
            state: Mutex::new(QueryState {
                result: None,
                deps: BTreeSet::new(),
                loading: false,
                reload_pending: false,
                subscribers: HashSet::new(),
                generation: 0,
            }),
            loaded_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> String {
        query_hash(&self.collection_name, &self.expression)
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Current result ids (empty for aggregates).
    pub fn ids(&self) -> Vec<String> {
        self.lock().result.as_ref().map(QueryResult::ids).unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Whether a commit of `(collection_name, doc_id)` can change the result.
    pub(crate) fn depends_on(&self, collection_name: &str, doc_id: &str) -> bool {
        collection_name == self.collection_name
            || self
                .lock()
                .deps
                .contains(&(collection_name.to_string(), doc_id.to_string()))
    }

    pub(crate) async fn ensure_loaded(&self) {
        let mut rx = self.loaded_tx.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Re-run against storage and push changes to subscribers. Coalesced the
    /// same way as document loads.
    pub(crate) async fn load(self: &Arc<Self>, shared: &Arc<Shared>) {
        {
            let mut s = self.lock();
            if s.loading {
                s.reload_pending = true;
                return;
            }
            s.loading = true;
        }
        loop {
            let outcome = self.run(shared).await;
            let again = {
                let mut s = self.lock();
                match outcome {
                    Ok((result, deps)) => {
                        s.deps = deps;
                        let previous = s.result.replace(result);
                        if let Some(previous) = previous {
                            self.push_changes(shared, &s, &previous);
                        }
                    }
                    Err(e) => log::error!("Failed to run query {}: {e}", self.key()),
                }
                let again = std::mem::take(&mut s.reload_pending);
                if !again {
                    s.loading = false;
                }
                again
            };
            if !again {
                break;
            }
        }
        self.loaded_tx.send_replace(true);
    }

    async fn run(&self, shared: &Shared) -> Result<(QueryResult, BTreeSet<(String, String)>), StorageError> {
        let refs = join_refs(&self.expression);
        if refs.is_empty() {
            let result = shared
                .storage
                .get_docs_by_query(&self.collection_name, &self.expression)
                .await?;
            return Ok((result, BTreeSet::new()));
        }
        let mut deps = BTreeSet::new();
        let mut values = HashMap::new();
        for r in refs {
            deps.insert((r.collection_name.clone(), r.doc_id.clone()));
            let value = shared
                .storage
                .get_doc_by_id(&r.collection_name, &r.doc_id)
                .await?
                .and_then(|d| d.snapshot())
                .and_then(|s| get_path(&s, &r.field).cloned());
            values.insert(r, value);
        }
        let expression = resolve_joins(&self.expression, &|r: &JoinRef| values.get(r).cloned().flatten());
        log::trace!("Resolved join query {} to {expression}", self.key());
        let result = shared
            .storage
            .get_docs_by_query(&self.collection_name, &expression)
            .await?;
        Ok((result, deps))
    }

    /// Send one channel the full result as seen through `name`, with the
    /// operations it is missing. With `attach`, the channel is subscribed
    /// and the snapshot queued under the same lock, so no diff can precede
    /// it. Nothing is sent before the first load completes.
    pub(crate) fn send_snapshot(&self, shared: &Shared, channel_id: ChannelId, name: &str, attach: bool) {
        let mut s = self.lock();
        if attach {
            s.subscribers.insert((channel_id, name.to_string()));
            s.generation += 1;
        }
        let Some(result) = s.result.as_ref() else {
            return;
        };
        let mut sessions = shared.lock_sessions();
        let Some(entry) = sessions.get_mut(&channel_id) else {
            return;
        };
        let (value, ops) = match result {
            QueryResult::Docs(docs) => {
                let ids = docs.iter().map(|d| Value::String(d.id.clone())).collect();
                let ops = docs
                    .iter()
                    .flat_map(|d| shared.missing_ops(&mut entry.session, name, d))
                    .collect();
                (Value::Array(ids), ops)
            }
            QueryResult::Value(v) => (v.clone(), Vec::new()),
        };
        entry.channel.send(Message::Control(Control::Q(QuerySnapshot {
            collection_name: name.to_string(),
            expression: self.expression.clone(),
            value,
            ops,
        })));
    }

    fn push_changes(&self, shared: &Shared, s: &QueryState, previous: &QueryResult) {
        let Some(current) = s.result.as_ref() else {
            return;
        };
        let diffs = match current {
            QueryResult::Docs(_) => diff_ids(&previous.ids(), &current.ids()),
            QueryResult::Value(_) => Vec::new(),
        };
        let mut sessions = shared.lock_sessions();
        for (channel_id, name) in &s.subscribers {
            let Some(entry) = sessions.get_mut(channel_id) else {
                continue;
            };
            let message = match current {
                QueryResult::Docs(docs) => {
                    let ops: Vec<_> = docs
                        .iter()
                        .flat_map(|d| shared.missing_ops(&mut entry.session, name, d))
                        .collect();
                    if diffs.is_empty() && ops.is_empty() {
                        continue;
                    }
                    Control::Qdiff(QueryDiff {
                        collection_name: name.clone(),
                        expression: self.expression.clone(),
                        diffs: diffs.clone(),
                        ops,
                    })
                }
                QueryResult::Value(value) => {
                    if matches!(previous, QueryResult::Value(old) if old == value) {
                        continue;
                    }
                    Control::Q(QuerySnapshot {
                        collection_name: name.clone(),
                        expression: self.expression.clone(),
                        value: value.clone(),
                        ops: Vec::new(),
                    })
                }
            };
            entry.channel.send(Message::Control(message));
        }
    }

    pub(crate) fn detach(&self, channel_id: ChannelId, name: &str) -> Option<u64> {
        let mut s = self.lock();
        s.subscribers.remove(&(channel_id, name.to_string()));
        idle_generation(&mut s)
    }

    pub(crate) fn detach_channel(&self, channel_id: ChannelId) -> Option<u64> {
        let mut s = self.lock();
        let before = s.subscribers.len();
        s.subscribers.retain(|(c, _)| *c != channel_id);
        if s.subscribers.len() == before {
            return None;
        }
        idle_generation(&mut s)
    }

    pub(crate) fn idle(&self) -> Option<u64> {
        idle_generation(&mut self.lock())
    }

    pub(crate) fn unattach_check(&self, generation: u64) -> Unattach {
        let s = self.lock();
        if !s.subscribers.is_empty() || s.generation != generation {
            Unattach::Cancelled
        } else if s.loading {
            Unattach::Busy
        } else {
            Unattach::Ready
        }
    }
}

fn idle_generation(s: &mut QueryState) -> Option<u64> {
    if !s.subscribers.is_empty() {
        return None;
    }
    s.generation += 1;
    Some(s.generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage, StoredDoc};
    use crate::store::{Store, StoreOptions};
    use async_trait::async_trait;
    use replica_core::{Document, OpKind, Operation, VersionVector};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Reads are taken first and answered after a delay, so writes can land
    /// while a query is in flight.
    struct SlowStorage {
        inner: MemoryStorage,
        scans: AtomicUsize,
    }

    #[async_trait]
    impl Storage for SlowStorage {
        async fn init(&self) -> Result<(), StorageError> {
            self.inner.init().await
        }

        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }

        async fn get_doc_by_id(&self, collection_name: &str, doc_id: &str) -> Result<Option<StoredDoc>, StorageError> {
            self.inner.get_doc_by_id(collection_name, doc_id).await
        }

        async fn get_docs(&self, collection_name: &str) -> Result<Vec<StoredDoc>, StorageError> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            let docs = self.inner.get_docs(collection_name).await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            docs
        }

        async fn save_doc(
            &self,
            collection_name: &str,
            doc: &StoredDoc,
            prev_version: Option<&VersionVector>,
        ) -> Result<(), StorageError> {
            self.inner.save_doc(collection_name, doc, prev_version).await
        }
    }

    fn stored(doc_id: &str) -> StoredDoc {
        let add = Operation::new(OpKind::Add, "s", 1, "users", doc_id).with_value(json!({}));
        StoredDoc::from_document(&Document::from_ops("users", doc_id, vec![add]))
    }

    async fn slow_store() -> (Arc<SlowStorage>, Store) {
        let inner = MemoryStorage::new();
        inner.save_doc("users", &stored("1"), None).await.unwrap();
        let storage = Arc::new(SlowStorage {
            inner,
            scans: AtomicUsize::new(0),
        });
        let store = Store::new(storage.clone(), StoreOptions::for_testing());
        (storage, store)
    }

    #[tokio::test]
    async fn test_concurrent_reloads_coalesce() {
        let (storage, store) = slow_store().await;
        let shared = &store.shared;
        let query = ServerQuery::new("users", json!({}));
        tokio::join!(
            query.load(shared),
            query.load(shared),
            query.load(shared),
            query.load(shared)
        );
        // One run plus exactly one rerun for everything that arrived meanwhile.
        assert_eq!(storage.scans.load(Ordering::SeqCst), 2);
        assert_eq!(query.ids(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_write_during_load_is_not_lost() {
        let (storage, store) = slow_store().await;
        let shared = &store.shared;
        let query = ServerQuery::new("users", json!({}));
        let write = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            storage.inner.save_doc("users", &stored("2"), None).await.unwrap();
            query.load(shared).await;
        };
        tokio::join!(query.load(shared), write);
        assert_eq!(storage.scans.load(Ordering::SeqCst), 2);
        assert_eq!(query.ids(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_depends_on_joined_docs() {
        let (_, store) = slow_store().await;
        let query = ServerQuery::new("posts", json!({"author": "$users.1.name"}));
        assert_eq!(query.kind(), QueryKind::Join);
        assert!(!query.depends_on("users", "1"));
        query.load(&store.shared).await;
        assert!(query.depends_on("posts", "anything"));
        assert!(query.depends_on("users", "1"));
        assert!(!query.depends_on("users", "2"));
    }
}
