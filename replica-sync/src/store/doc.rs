//! Authoritative in-memory document.
//!
//! ```text
//!  on_op ─► apply ─► broadcast (per-session delta) ─► save ─┬─ ok ──► on_committed
//!                                                           └─ stale ► reload, merge, retry
//! ```
//!
//! `loading`/`reload_pending` make a load that races with another trigger run
//! exactly once more afterwards. `saving`/`save_pending` do the same for saves.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use replica_core::{Document, Operation, ProjectionError, VersionVector};
use serde_json::Value;
use tokio::sync::watch;

use super::{Shared, Unattach};
use crate::channel::ChannelId;
use crate::storage::{StorageError, StoredDoc};

struct DocState {
    doc: Document,
    loading: bool,
    reload_pending: bool,
    /// Version last read from or written to storage
    prev_version: Option<VersionVector>,
    saving: bool,
    save_pending: bool,
    save_scheduled: bool,
    /// Applied ops not yet durable, with the value they replaced
    uncommitted: Vec<(Operation, Option<Value>)>,
    /// `(channel, collection name as subscribed)`
    subscribers: HashSet<(ChannelId, String)>,
    generation: u64,
}

pub struct ServerDoc {
    collection_name: String,
    doc_id: String,
    state: Mutex<DocState>,
    loaded_tx: watch::Sender<bool>,
}

impl ServerDoc {
    pub(crate) fn new(collection_name: &str, doc_id: &str) -> Arc<Self> {
        let (loaded_tx, _) = watch::channel(false);
        Arc::new(Self {
            collection_name: collection_name.to_string(),
            doc_id: doc_id.to_string(),
            state: Mutex::new(DocState {
                doc: Document::new(collection_name, doc_id),
                loading: false,
                reload_pending: false,
                prev_version: None,
                saving: false,
                save_pending: false,
                save_scheduled: false,
                uncommitted: Vec::new(),
                subscribers: HashSet::new(),
                generation: 0,
            }),
            loaded_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Copy of the current document.
    pub fn document(&self) -> Document {
        self.lock().doc.clone()
    }

    pub fn version(&self) -> VersionVector {
        self.lock().doc.version()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub(crate) async fn ensure_loaded(&self) {
        let mut rx = self.loaded_tx.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Read from storage and merge. A call made while a load is in flight
    /// schedules one more pass instead of running concurrently.
    pub(crate) async fn load(self: &Arc<Self>, shared: &Arc<Shared>) {
        {
            let mut s = self.lock();
            if s.loading {
                log::trace!("Deferring reload of {}/{}", self.collection_name, self.doc_id);
                s.reload_pending = true;
                return;
            }
            s.loading = true;
        }
        loop {
            let result = shared.storage.get_doc_by_id(&self.collection_name, &self.doc_id).await;
            let (again, changed) = {
                let mut s = self.lock();
                let changed = match result {
                    Ok(stored) => s.merge_stored(stored),
                    Err(e) => {
                        log::error!("Failed to load {}/{}: {e}", self.collection_name, self.doc_id);
                        false
                    }
                };
                let again = std::mem::take(&mut s.reload_pending);
                if !again {
                    s.loading = false;
                }
                (again, changed)
            };
            if changed {
                self.broadcast(shared);
            }
            if !again {
                break;
            }
        }
        self.loaded_tx.send_replace(true);
    }

    /// Apply a client operation. Returns `Ok(false)` for a duplicate. With
    /// `create_only`, a whole-document op is refused once the document
    /// exists.
    pub(crate) fn apply(&self, op: Operation, create_only: bool) -> Result<bool, ProjectionError> {
        let mut s = self.lock();
        if s.doc.has_op(&op.id) {
            return Ok(false);
        }
        if create_only && op.field.is_none() && s.doc.exists() {
            return Err(ProjectionError::WholeDocumentNotAllowed);
        }
        let previous = match op.field.as_deref() {
            Some(field) => s.doc.get_field(field),
            None => s.doc.get(),
        };
        if !s.doc.apply_op(op.clone()) {
            return Ok(false);
        }
        s.uncommitted.push((op, previous));
        Ok(true)
    }

    /// Apply an operation some other process already committed.
    pub(crate) fn apply_committed(&self, op: Operation) -> bool {
        self.lock().doc.apply_op(op)
    }

    /// Send every subscriber what it is missing.
    pub(crate) fn broadcast(&self, shared: &Shared) {
        let s = self.lock();
        let mut sessions = shared.lock_sessions();
        for (channel_id, name) in &s.subscribers {
            if let Some(entry) = sessions.get_mut(channel_id) {
                shared.deliver_doc(entry, name, &s.doc);
            }
        }
    }

    /// Send one channel what it is missing, without subscribing it.
    pub(crate) fn deliver_to(&self, shared: &Shared, channel_id: ChannelId, name: &str) {
        let s = self.lock();
        if let Some(entry) = shared.lock_sessions().get_mut(&channel_id) {
            shared.deliver_doc(entry, name, &s.doc);
        }
    }

    /// Persist, immediately or after the configured debounce interval.
    pub(crate) async fn save(self: &Arc<Self>, shared: &Arc<Shared>) {
        let Some(interval) = shared.options.save_debounce else {
            self.commit(shared).await;
            return;
        };
        {
            let mut s = self.lock();
            if s.save_scheduled {
                return;
            }
            s.save_scheduled = true;
        }
        let doc = self.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            doc.lock().save_scheduled = false;
            doc.commit(&shared).await;
        });
    }

    async fn commit(self: &Arc<Self>, shared: &Arc<Shared>) {
        {
            let mut s = self.lock();
            if s.saving {
                s.save_pending = true;
                return;
            }
            s.saving = true;
        }
        loop {
            let (stored, prev_version, batch) = {
                let mut s = self.lock();
                s.save_pending = false;
                s.doc.distill();
                (
                    StoredDoc::from_document(&s.doc),
                    s.prev_version.clone(),
                    std::mem::take(&mut s.uncommitted),
                )
            };
            match shared
                .storage
                .save_doc(&self.collection_name, &stored, prev_version.as_ref())
                .await
            {
                Ok(()) => {
                    let again = {
                        let mut s = self.lock();
                        s.prev_version = Some(stored.version.clone());
                        if !s.save_pending {
                            s.saving = false;
                        }
                        s.save_pending
                    };
                    shared.on_committed(&self.collection_name, &self.doc_id, batch).await;
                    if !again {
                        return;
                    }
                }
                Err(StorageError::StaleData) => {
                    log::debug!(
                        "Stale data saving {}/{}, reloading and retrying",
                        self.collection_name,
                        self.doc_id
                    );
                    self.lock().uncommitted.splice(0..0, batch);
                    if !self.refresh(shared).await {
                        self.lock().saving = false;
                        return;
                    }
                }
                Err(e) => {
                    log::error!("Failed to save {}/{}: {e}", self.collection_name, self.doc_id);
                    let mut s = self.lock();
                    s.uncommitted.splice(0..0, batch);
                    s.saving = false;
                    return;
                }
            }
        }
    }

    /// Re-read storage after a lost compare-and-swap.
    async fn refresh(&self, shared: &Shared) -> bool {
        match shared.storage.get_doc_by_id(&self.collection_name, &self.doc_id).await {
            Ok(stored) => {
                let changed = self.lock().merge_stored(stored);
                if changed {
                    self.broadcast(shared);
                }
                true
            }
            Err(e) => {
                log::error!("Failed to reload {}/{}: {e}", self.collection_name, self.doc_id);
                false
            }
        }
    }

    /// Start delivering to `(channel_id, name)`; cancels a pending unattach.
    pub(crate) fn attach(&self, channel_id: ChannelId, name: &str) {
        let mut s = self.lock();
        s.subscribers.insert((channel_id, name.to_string()));
        s.generation += 1;
    }

    /// Stop delivering. Returns the generation to unattach at once no
    /// subscribers remain.
    pub(crate) fn detach(&self, channel_id: ChannelId, name: &str) -> Option<u64> {
        let mut s = self.lock();
        s.subscribers.remove(&(channel_id, name.to_string()));
        s.idle_generation()
    }

    pub(crate) fn detach_channel(&self, channel_id: ChannelId) -> Option<u64> {
        let mut s = self.lock();
        let before = s.subscribers.len();
        s.subscribers.retain(|(c, _)| *c != channel_id);
        if s.subscribers.len() == before {
            return None;
        }
        s.idle_generation()
    }

    /// Bump the generation if nobody is subscribed, so an unattach can be
    /// scheduled against it.
    pub(crate) fn idle(&self) -> Option<u64> {
        self.lock().idle_generation()
    }

    pub(crate) fn unattach_check(&self, generation: u64) -> Unattach {
        let s = self.lock();
        if !s.subscribers.is_empty() || s.generation != generation {
            Unattach::Cancelled
        } else if s.saving || s.save_scheduled || !s.uncommitted.is_empty() || s.loading {
            Unattach::Busy
        } else {
            Unattach::Ready
        }
    }
}

impl DocState {
    fn merge_stored(&mut self, stored: Option<StoredDoc>) -> bool {
        match stored {
            Some(stored) => {
                self.prev_version = Some(stored.version);
                self.doc.apply_ops(stored.ops) > 0
            }
            None => {
                self.prev_version = None;
                false
            }
        }
    }

    fn idle_generation(&mut self) -> Option<u64> {
        if !self.subscribers.is_empty() {
            return None;
        }
        self.generation += 1;
        Some(self.generation)
    }
}
