//! Server-side store: authoritative documents, live queries and the
//! per-connection message dispatcher.
//!
//! ```text
//!   Link ─► connect() task ─► handle_message ─┬─ op ──────► ServerDoc ─► Storage (CAS)
//!                                             ├─ sub/fetch ─► ServerDoc ─► missing ops
//!                                             ├─ qsub/qfetch ► ServerQuery ─► q snapshot
//!                                             └─ handshake ─► all of the above
//!
//!   committed op ─► PubSub ─► other stores ─► in-memory doc + query reload
//! ```
//!
//! Every connection is processed sequentially by its own task. Shared state
//! lives behind short-lived std mutexes; no lock is held across an await.
//! Lock order is the docs or queries map, then entity state, then sessions.

pub mod doc;
pub mod options;
pub mod query;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use replica_core::{now_ms, query_hash, Document, Operation, Projection, ProjectionError, VersionVector};
use serde_json::Value;

pub use doc::ServerDoc;
pub use options::{AfterHook, HookContext, PreHook, StoreOptions};
pub use query::ServerQuery;

use crate::channel::{Channel, ChannelId, Link};
use crate::protocol::{Control, DocRequest, Handshake, Message, QueryRequest};
use crate::pubsub::PubSubEvent;
use crate::session::ChannelSession;
use crate::storage::{Storage, StorageError, StoredDoc};

/// How many published op ids are remembered to skip our own pub/sub echoes.
const SENT_OPS_CAPACITY: usize = 10_000;

/// Outcome of a grace-period check on an idle doc or query.
pub(crate) enum Unattach {
    Ready,
    /// Still loading or saving; check again after another grace period
    Busy,
    /// Re-subscribed in the meantime
    Cancelled,
}

pub(crate) struct ChannelEntry {
    pub(crate) channel: Channel,
    pub(crate) session: ChannelSession,
}

#[derive(Default)]
struct SentOps {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SentOps {
    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > SENT_OPS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

type DocKey = (String, String);

/// State shared by a store, its connection tasks and its timers.
pub(crate) struct Shared {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) options: StoreOptions,
    projections: HashMap<String, Projection>,
    sessions: Mutex<HashMap<ChannelId, ChannelEntry>>,
    docs: Mutex<HashMap<DocKey, Arc<ServerDoc>>>,
    queries: Mutex<HashMap<String, Arc<ServerQuery>>>,
    sent_ops: Mutex<SentOps>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn lock_sessions(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelEntry>> {
        lock(&self.sessions)
    }

    fn projection(&self, name: &str) -> Option<&Projection> {
        self.projections.get(name)
    }

    /// Storage collection behind a client-facing name.
    fn base_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.projection(name)
            .map_or(name, |p| p.base_collection_name.as_str())
    }

    fn send(&self, channel_id: ChannelId, msg: Message) {
        if let Some(entry) = self.lock_sessions().get(&channel_id) {
            entry.channel.send(msg);
        }
    }

    fn with_session<R>(&self, channel_id: ChannelId, f: impl FnOnce(&mut ChannelSession) -> R) -> Option<R> {
        self.lock_sessions()
            .get_mut(&channel_id)
            .map(|entry| f(&mut entry.session))
    }

    /// Send `entry` the operations of `doc` it lacks, as seen through `name`.
    pub(crate) fn deliver_doc(&self, entry: &mut ChannelEntry, name: &str, doc: &Document) {
        let version = entry
            .session
            .doc_version(name, doc.doc_id())
            .cloned()
            .unwrap_or_default();
        let ops = doc.ops_to_send(&version);
        let ops = match self.projection(name) {
            Some(p) => p.project_ops(&ops),
            None => ops,
        };
        if ops.is_empty() {
            return;
        }
        for op in ops {
            entry.channel.send(Message::Op(op));
        }
        let version = doc.version();
        entry.session.note_doc(name, doc.doc_id(), &version);
        // Tell the client which version it now holds.
        entry.channel.send(Message::Control(Control::Sync(DocRequest {
            id: None,
            collection_name: name.to_string(),
            doc_id: doc.doc_id().to_string(),
            version: Some(version),
        })));
    }

    /// Operations of a stored doc the session lacks; records them as known.
    pub(crate) fn missing_ops(&self, session: &mut ChannelSession, name: &str, stored: &StoredDoc) -> Vec<Operation> {
        let version = session.doc_version(name, &stored.id).cloned().unwrap_or_default();
        let missing = stored.ops.iter().filter(|op| !version.covers(op));
        let ops = match self.projection(name) {
            Some(p) => p.project_ops(missing),
            None => missing.cloned().collect(),
        };
        session.note_doc(name, &stored.id, &stored.version);
        ops
    }

    /// Publish, run after-hooks and refresh dependent queries once a batch
    /// is durable.
    pub(crate) async fn on_committed(
        self: &Arc<Self>,
        collection_name: &str,
        doc_id: &str,
        batch: Vec<(Operation, Option<Value>)>,
    ) {
        for (op, previous) in &batch {
            if let Some(bus) = &self.options.pubsub {
                lock(&self.sent_ops).insert(&op.id);
                if let Err(e) = bus.publish(op) {
                    log::warn!("Failed to publish op {}: {e}", op.id);
                }
            }
            if let Some(hook) = &self.options.after_hook {
                hook(op, previous.as_ref());
            }
        }
        self.reload_queries(collection_name, doc_id).await;
    }

    async fn reload_queries(self: &Arc<Self>, collection_name: &str, doc_id: &str) {
        let affected: Vec<Arc<ServerQuery>> = lock(&self.queries)
            .values()
            .filter(|q| q.depends_on(collection_name, doc_id))
            .cloned()
            .collect();
        for query in affected {
            query.load(self).await;
        }
    }

    /// Apply an op another store committed.
    async fn on_published(self: &Arc<Self>, op: Operation) {
        if lock(&self.sent_ops).ids.contains(&op.id) {
            return;
        }
        let key = (op.collection_name.clone(), op.doc_id.clone());
        let doc = lock(&self.docs).get(&key).cloned();
        if let Some(doc) = doc {
            if doc.apply_committed(op) {
                doc.broadcast(self);
            }
        }
        self.reload_queries(&key.0, &key.1).await;
    }

    /// Missed some published ops: re-read every in-memory doc and query.
    async fn on_lagged(self: &Arc<Self>) {
        let docs: Vec<_> = lock(&self.docs).values().cloned().collect();
        let queries: Vec<_> = lock(&self.queries).values().cloned().collect();
        log::info!("Reloading {} docs and {} queries after pub/sub lag", docs.len(), queries.len());
        for doc in docs {
            doc.load(self).await;
        }
        for query in queries {
            query.load(self).await;
        }
    }

    /// Apply a client op to `doc` only while it is still the registered
    /// instance, so an unattach cannot drop it. `None` if it was unattached.
    fn apply_to_current(
        &self,
        doc: &Arc<ServerDoc>,
        op: &Operation,
        create_only: bool,
    ) -> Option<Result<bool, ProjectionError>> {
        let key = (doc.collection_name().to_string(), doc.doc_id().to_string());
        let docs = lock(&self.docs);
        if !docs.get(&key).is_some_and(|d| Arc::ptr_eq(d, doc)) {
            return None;
        }
        Some(doc.apply(op.clone(), create_only))
    }

    fn is_current_doc(&self, doc: &Arc<ServerDoc>) -> bool {
        let key = (doc.collection_name().to_string(), doc.doc_id().to_string());
        lock(&self.docs).get(&key).is_some_and(|d| Arc::ptr_eq(d, doc))
    }
}

/// Authoritative server store. Clones share state.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    pub fn new(storage: Arc<dyn Storage>, options: StoreOptions) -> Self {
        let projections = options
            .projections
            .iter()
            .map(|p| (p.collection_name.clone(), p.clone()))
            .collect();
        Self {
            shared: Arc::new(Shared {
                storage,
                options,
                projections,
                sessions: Mutex::new(HashMap::new()),
                docs: Mutex::new(HashMap::new()),
                queries: Mutex::new(HashMap::new()),
                sent_ops: Mutex::new(SentOps::default()),
            }),
        }
    }

    /// Initialize storage and start listening on the pub/sub bus.
    pub async fn init(&self) -> Result<(), StorageError> {
        self.shared.storage.init().await?;
        if let Some(bus) = &self.shared.options.pubsub {
            let mut rx = bus.subscribe();
            let shared = Arc::downgrade(&self.shared);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    match event {
                        PubSubEvent::Op(op) => shared.on_published(op).await,
                        PubSubEvent::Lagged(_) => shared.on_lagged().await,
                    }
                }
                log::debug!("Pub/sub listener stopped");
            });
        }
        Ok(())
    }

    pub fn options(&self) -> &StoreOptions {
        &self.shared.options
    }

    /// `projection name → hash` for every configured projection.
    pub fn projection_hashes(&self) -> BTreeMap<String, String> {
        self.shared
            .projections
            .values()
            .map(|p| (p.collection_name.clone(), p.hash()))
            .collect()
    }

    /// Serve a connection until its link closes.
    pub fn connect(&self, link: Link) -> ChannelId {
        let Link { tx, mut rx } = link;
        let channel = Channel::new(tx);
        let channel_id = channel.id();
        self.shared.lock_sessions().insert(
            channel_id,
            ChannelEntry {
                channel,
                session: ChannelSession::new(),
            },
        );
        log::debug!("Channel {channel_id} connected");
        let store = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                store.handle_message(channel_id, msg).await;
            }
            store.disconnect(channel_id);
        });
        channel_id
    }

    /// In-process connection; returns the client end.
    pub fn connect_local(&self) -> Link {
        let (client, server) = Link::pair();
        self.connect(server);
        client
    }

    pub fn channel_count(&self) -> usize {
        self.shared.lock_sessions().len()
    }

    /// Documents currently held in memory.
    pub fn doc_count(&self) -> usize {
        lock(&self.shared.docs).len()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.shared.queries).len()
    }

    pub fn doc(&self, collection_name: &str, doc_id: &str) -> Option<Arc<ServerDoc>> {
        lock(&self.shared.docs)
            .get(&(collection_name.to_string(), doc_id.to_string()))
            .cloned()
    }

    pub async fn handle_message(&self, channel_id: ChannelId, msg: Message) {
        match msg {
            Message::Op(op) => self.on_op(channel_id, op).await,
            Message::Control(Control::Date { id, .. }) => {
                self.shared.send(channel_id, Message::Control(Control::Ackdate { id, value: now_ms() }));
            }
            Message::Control(Control::Sub(req) | Control::Sync(req)) => self.on_sub(channel_id, req, true).await,
            Message::Control(Control::Fetch(req)) => self.on_sub(channel_id, req, false).await,
            Message::Control(Control::Unsub(req)) => self.on_unsub(channel_id, req),
            Message::Control(Control::Qsub(req) | Control::Qsync(req)) => self.on_qsub(channel_id, req, true).await,
            Message::Control(Control::Qfetch(req)) => self.on_qsub(channel_id, req, false).await,
            Message::Control(Control::Qunsub(req)) => self.on_qunsub(channel_id, req),
            Message::Control(Control::Handshake(handshake)) => self.on_handshake(channel_id, handshake).await,
            other => log::debug!("Ignoring {} message from channel {channel_id}", other.type_name()),
        }
    }

    async fn on_op(&self, channel_id: ChannelId, op: Operation) {
        let name = op.collection_name.clone();
        let op_id = op.id.clone();
        let projection = self.shared.projection(&name);
        let op = match projection {
            Some(projection) => match projection.to_base_op(&op) {
                Ok(op) => op,
                Err(e) => {
                    log::info!("Rejected op {op_id} on {name}: {e}");
                    self.shared.send(channel_id, Message::ack_op(op_id, Some(e.to_string())));
                    return;
                }
            },
            None => op,
        };
        if let Some(hook) = &self.shared.options.pre_hook {
            let context = HookContext {
                channel_id,
                collection_name: name.clone(),
            };
            if let Err(reason) = hook(&op, &context) {
                log::info!("Pre-hook rejected op {op_id} on {name}: {reason}");
                self.shared.send(channel_id, Message::ack_op(op_id, Some(reason)));
                return;
            }
        }

        let mut own = VersionVector::new();
        own.insert(&op.source, op.date);
        let doc_id = op.doc_id.clone();
        let (doc, applied) = loop {
            let doc = self.load_doc(&op.collection_name, &op.doc_id).await;
            if let Some(applied) = self.shared.apply_to_current(&doc, &op, projection.is_some()) {
                break (doc, applied);
            }
            log::trace!("Doc {}/{} unattached before op {op_id}, reloading", op.collection_name, op.doc_id);
        };
        let error = match applied {
            Ok(applied) => {
                // The origin already holds its own operation.
                self.shared
                    .with_session(channel_id, |s| s.note_doc(&name, &doc_id, &own));
                if applied {
                    doc.broadcast(&self.shared);
                    doc.save(&self.shared).await;
                }
                None
            }
            Err(e) => {
                log::info!("Rejected op {op_id} on {name}: {e}");
                Some(e.to_string())
            }
        };
        self.shared.send(channel_id, Message::ack_op(op_id, error));
        if let Some(generation) = doc.idle() {
            self.schedule_doc_unattach(doc, generation);
        }
    }

    async fn on_sub(&self, channel_id: ChannelId, req: DocRequest, attach: bool) {
        let name = req.collection_name.as_str();
        let base = self.shared.base_name(name).to_string();
        let version = req.version.clone().unwrap_or_default();
        self.shared.with_session(channel_id, |s| {
            if attach {
                s.subscribe_doc(name, &req.doc_id, version);
            } else {
                s.note_doc(name, &req.doc_id, &version);
            }
        });

        let doc = loop {
            let doc = self.load_doc(&base, &req.doc_id).await;
            if !attach {
                break doc;
            }
            doc.attach(channel_id, name);
            if self.shared.is_current_doc(&doc) {
                break doc;
            }
            // Unattached between lookup and attach; start over.
            doc.detach(channel_id, name);
        };
        doc.deliver_to(&self.shared, channel_id, name);
        if let Some(id) = req.id {
            let version = doc.version().to_string();
            self.shared.send(channel_id, Message::ack(id, Some(Value::String(version))));
        }
        if !attach {
            if let Some(generation) = doc.idle() {
                self.schedule_doc_unattach(doc, generation);
            }
        }
    }

    fn on_unsub(&self, channel_id: ChannelId, req: DocRequest) {
        let name = req.collection_name.as_str();
        self.shared
            .with_session(channel_id, |s| s.unsubscribe_doc(name, &req.doc_id));
        if let Some(doc) = self.doc(self.shared.base_name(name), &req.doc_id) {
            if let Some(generation) = doc.detach(channel_id, name) {
                self.schedule_doc_unattach(doc, generation);
            }
        }
        if let Some(id) = req.id {
            self.shared.send(channel_id, Message::ack(id, None));
        }
    }

    async fn on_qsub(&self, channel_id: ChannelId, req: QueryRequest, attach: bool) {
        let name = req.collection_name.as_str();
        if let Some(projection) = self.shared.projection(name) {
            if let Err(e) = projection.validate_expression(&req.expression) {
                log::info!("Rejected query on {name}: {e}");
                if let Some(id) = req.id {
                    self.shared.send(channel_id, Message::ack_error(id, e.to_string()));
                }
                return;
            }
        }
        let base = self.shared.base_name(name).to_string();
        let client_hash = query_hash(name, &req.expression);
        self.shared.with_session(channel_id, |s| {
            for (doc_id, version) in &req.doc_versions {
                s.note_doc(name, doc_id, version);
            }
            if attach {
                s.subscribe_query(&client_hash);
            }
        });

        let query = self.load_query(&base, &req.expression).await;
        query.send_snapshot(&self.shared, channel_id, name, attach);
        if let Some(id) = req.id {
            self.shared.send(channel_id, Message::ack(id, None));
        }
        if !attach {
            if let Some(generation) = query.idle() {
                self.schedule_query_unattach(query, generation);
            }
        }
    }

    fn on_qunsub(&self, channel_id: ChannelId, req: QueryRequest) {
        let name = req.collection_name.as_str();
        self.shared
            .with_session(channel_id, |s| s.unsubscribe_query(&query_hash(name, &req.expression)));
        let key = query_hash(self.shared.base_name(name), &req.expression);
        let query = lock(&self.shared.queries).get(&key).cloned();
        if let Some(query) = query {
            if let Some(generation) = query.detach(channel_id, name) {
                self.schedule_query_unattach(query, generation);
            }
        }
        if let Some(id) = req.id {
            self.shared.send(channel_id, Message::ack(id, None));
        }
    }

    /// Reconnect: replay the client's offline ops, then restore its
    /// subscriptions. Data of projections whose definition changed is resent
    /// from scratch.
    async fn on_handshake(&self, channel_id: ChannelId, handshake: Handshake) {
        let hashes = self.projection_hashes();
        self.shared.send(
            channel_id,
            Message::Control(Control::Projections { hashes: hashes.clone() }),
        );
        let changed = |name: &str| handshake.projection_hashes.get(name) != hashes.get(name);

        log::debug!(
            "Handshake from channel {channel_id}: {} docs, {} queries",
            handshake.docs.len(),
            handshake.queries.len()
        );
        for doc in &handshake.docs {
            for op in &doc.ops {
                self.on_op(channel_id, op.clone()).await;
            }
            let version = if changed(&doc.collection_name) {
                VersionVector::new()
            } else {
                doc.version.clone()
            };
            let req = DocRequest {
                id: None,
                collection_name: doc.collection_name.clone(),
                doc_id: doc.doc_id.clone(),
                version: Some(version),
            };
            self.on_sub(channel_id, req, doc.subscribed).await;
        }
        for query in &handshake.queries {
            let mut req = query.clone();
            req.id = None;
            if changed(&req.collection_name) {
                req.doc_versions.clear();
            }
            self.on_qsub(channel_id, req, true).await;
        }
        self.shared.send(channel_id, Message::ack(handshake.id, None));
    }

    fn disconnect(&self, channel_id: ChannelId) {
        self.shared.lock_sessions().remove(&channel_id);
        let docs: Vec<_> = lock(&self.shared.docs).values().cloned().collect();
        for doc in docs {
            if let Some(generation) = doc.detach_channel(channel_id) {
                self.schedule_doc_unattach(doc, generation);
            }
        }
        let queries: Vec<_> = lock(&self.shared.queries).values().cloned().collect();
        for query in queries {
            if let Some(generation) = query.detach_channel(channel_id) {
                self.schedule_query_unattach(query, generation);
            }
        }
        log::debug!("Channel {channel_id} disconnected");
    }

    /// Find or create the in-memory doc and wait until it has loaded.
    async fn load_doc(&self, collection_name: &str, doc_id: &str) -> Arc<ServerDoc> {
        let (doc, created) = {
            let mut docs = lock(&self.shared.docs);
            match docs.get(&(collection_name.to_string(), doc_id.to_string())) {
                Some(doc) => (doc.clone(), false),
                None => {
                    let doc = ServerDoc::new(collection_name, doc_id);
                    docs.insert((collection_name.to_string(), doc_id.to_string()), doc.clone());
                    (doc, true)
                }
            }
        };
        if created {
            doc.load(&self.shared).await;
        } else {
            doc.ensure_loaded().await;
        }
        doc
    }

    async fn load_query(&self, collection_name: &str, expression: &Value) -> Arc<ServerQuery> {
        let key = query_hash(collection_name, expression);
        let (query, created) = {
            let mut queries = lock(&self.shared.queries);
            match queries.get(&key) {
                Some(query) => (query.clone(), false),
                None => {
                    let query = ServerQuery::new(collection_name, expression.clone());
                    queries.insert(key, query.clone());
                    (query, true)
                }
            }
        };
        if created {
            query.load(&self.shared).await;
        } else {
            query.ensure_loaded().await;
        }
        query
    }

    fn schedule_doc_unattach(&self, doc: Arc<ServerDoc>, generation: u64) {
        let shared = Arc::downgrade(&self.shared);
        let grace = self.shared.options.unattach_grace;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(grace).await;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let key = (doc.collection_name().to_string(), doc.doc_id().to_string());
                let mut docs = lock(&shared.docs);
                match doc.unattach_check(generation) {
                    Unattach::Ready => {
                        if docs.get(&key).is_some_and(|d| Arc::ptr_eq(d, &doc)) {
                            docs.remove(&key);
                            log::debug!("Unattached doc {}/{}", key.0, key.1);
                        }
                        return;
                    }
                    Unattach::Busy => continue,
                    Unattach::Cancelled => return,
                }
            }
        });
    }

    fn schedule_query_unattach(&self, query: Arc<ServerQuery>, generation: u64) {
        let shared = Arc::downgrade(&self.shared);
        let grace = self.shared.options.unattach_grace;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(grace).await;
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let key = query.key();
                let mut queries = lock(&shared.queries);
                match query.unattach_check(generation) {
                    Unattach::Ready => {
                        if queries.get(&key).is_some_and(|q| Arc::ptr_eq(q, &query)) {
                            queries.remove(&key);
                            log::debug!("Unattached query {key}");
                        }
                        return;
                    }
                    Unattach::Busy => continue,
                    Unattach::Cancelled => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Ack;
    use crate::pubsub::{MemoryPubSub, PubSub};
    use crate::storage::MemoryStorage;
    use replica_core::{apply_id_diffs, OpKind};
    use serde_json::json;
    use std::time::Duration;

    fn store() -> Store {
        Store::new(Arc::new(MemoryStorage::new()), StoreOptions::for_testing())
    }

    async fn recv(link: &mut Link) -> Message {
        tokio::time::timeout(Duration::from_secs(2), link.recv())
            .await
            .expect("timed out")
            .expect("link closed")
    }

    async fn recv_ack(link: &mut Link) -> Ack {
        loop {
            if let Message::Control(Control::Ack(ack)) = recv(link).await {
                return ack;
            }
        }
    }

    fn sub(id: &str, doc_id: &str) -> Message {
        Message::Control(Control::Sub(DocRequest {
            id: Some(id.into()),
            collection_name: "users".into(),
            doc_id: doc_id.into(),
            version: None,
        }))
    }

    fn add(source: &str, date: u64, doc_id: &str, value: Value) -> Operation {
        Operation::new(OpKind::Add, source, date, "users", doc_id).with_value(value)
    }

    #[tokio::test]
    async fn test_op_acked_and_saved() {
        let storage = MemoryStorage::new();
        let store = Store::new(Arc::new(storage.clone()), StoreOptions::for_testing());
        let mut link = store.connect_local();

        let op = add("a", 1, "1", json!({"name": "Ann"}));
        link.send(Message::Op(op.clone()));
        let ack = recv_ack(&mut link).await;
        assert_eq!(ack.op_id.as_deref(), Some(op.id.as_str()));
        assert_eq!(ack.error, None);

        let stored = storage.get_doc_by_id("users", "1").await.unwrap().unwrap();
        assert_eq!(stored.state, Some(json!({"name": "Ann"})));
    }

    #[tokio::test]
    async fn test_sub_delivers_missing_ops_then_broadcasts() {
        let store = store();
        let mut writer = store.connect_local();
        let mut reader = store.connect_local();

        let first = add("w", 1, "1", json!({}));
        writer.send(Message::Op(first.clone()));
        recv_ack(&mut writer).await;

        reader.send(sub("s1", "1"));
        assert_eq!(recv(&mut reader).await, Message::Op(first));
        let ack = recv_ack(&mut reader).await;
        assert_eq!(ack.value, Some(json!("w 1")));

        let set = Operation::new(OpKind::Set, "w", 2, "users", "1")
            .with_field("n")
            .with_value(json!(1));
        writer.send(Message::Op(set.clone()));
        assert_eq!(recv(&mut reader).await, Message::Op(set));
    }

    #[tokio::test]
    async fn test_origin_gets_no_echo() {
        let store = store();
        let mut link = store.connect_local();
        link.send(sub("s1", "1"));
        recv_ack(&mut link).await;

        link.send(Message::Op(add("a", 1, "1", json!({}))));
        // First message back is the ack, not the op itself.
        assert!(matches!(
            recv(&mut link).await,
            Message::Control(Control::Ack(Ack { op_id: Some(_), .. }))
        ));
    }

    #[tokio::test]
    async fn test_pre_hook_rejects() {
        let options = StoreOptions::for_testing().with_pre_hook(|op, _| match op.kind {
            OpKind::Del => Err("deletes are not allowed".into()),
            _ => Ok(()),
        });
        let store = Store::new(Arc::new(MemoryStorage::new()), options);
        let mut link = store.connect_local();

        link.send(Message::Op(Operation::new(OpKind::Del, "a", 1, "users", "1")));
        let ack = recv_ack(&mut link).await;
        assert_eq!(ack.error.as_deref(), Some("deletes are not allowed"));
        assert!(store.doc("users", "1").is_none());
    }

    #[tokio::test]
    async fn test_date_reply() {
        let store = store();
        let mut link = store.connect_local();
        link.send(Message::Control(Control::Date { id: "d".into(), value: 0 }));
        match recv(&mut link).await {
            Message::Control(Control::Ackdate { id, value }) => {
                assert_eq!(id, "d");
                assert!(value > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_qsub_snapshot_then_diff() {
        let store = store();
        let mut writer = store.connect_local();
        let mut reader = store.connect_local();
        writer.send(Message::Op(add("w", 1, "1", json!({"age": 30}))));
        recv_ack(&mut writer).await;

        let expression = json!({"age": {"$gte": 18}});
        reader.send(Message::Control(Control::Qsub(QueryRequest {
            id: Some("q1".into()),
            collection_name: "users".into(),
            expression: expression.clone(),
            doc_versions: BTreeMap::new(),
        })));
        match recv(&mut reader).await {
            Message::Control(Control::Q(snapshot)) => {
                assert_eq!(snapshot.value, json!(["1"]));
                assert_eq!(snapshot.ops.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        recv_ack(&mut reader).await;

        writer.send(Message::Op(add("w", 2, "2", json!({"age": 40}))));
        match recv(&mut reader).await {
            Message::Control(Control::Qdiff(diff)) => {
                assert_eq!(diff.expression, expression);
                assert_eq!(diff.ops.len(), 1);
                assert_eq!(diff.ops[0].doc_id, "2");
                assert!(!diff.diffs.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unattach_after_grace() {
        let store = store();
        let mut link = store.connect_local();
        link.send(sub("s1", "1"));
        recv_ack(&mut link).await;
        assert_eq!(store.doc_count(), 1);

        link.send(Message::Control(Control::Unsub(DocRequest {
            id: Some("u1".into()),
            collection_name: "users".into(),
            doc_id: "1".into(),
            version: None,
        })));
        recv_ack(&mut link).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.doc_count(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_cancels_unattach() {
        let store = store();
        let mut link = store.connect_local();
        link.send(sub("s1", "1"));
        recv_ack(&mut link).await;
        link.send(Message::Control(Control::Unsub(DocRequest {
            id: None,
            collection_name: "users".into(),
            doc_id: "1".into(),
            version: None,
        })));
        link.send(sub("s2", "1"));
        recv_ack(&mut link).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.doc_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_drops_session() {
        let store = store();
        let link = store.connect_local();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.channel_count(), 1);
        drop(link);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.channel_count(), 0);
    }

    fn qsub(id: &str, collection_name: &str, expression: Value) -> Message {
        Message::Control(Control::Qsub(QueryRequest {
            id: Some(id.into()),
            collection_name: collection_name.into(),
            expression,
            doc_versions: BTreeMap::new(),
        }))
    }

    async fn recv_query_message(link: &mut Link) -> Control {
        loop {
            if let Message::Control(c @ (Control::Q(_) | Control::Qdiff(_))) = recv(link).await {
                return c;
            }
        }
    }

    fn id_list(value: &Value) -> Vec<String> {
        value
            .as_array()
            .map(|ids| ids.iter().filter_map(|id| id.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_qsub_snapshot_precedes_diffs() {
        let store = store();
        let mut writer = store.connect_local();
        let mut reader = store.connect_local();
        for date in 1..=30 {
            writer.send(Message::Op(add("w", date, &date.to_string(), json!({"age": 20}))));
        }
        reader.send(qsub("q1", "users", json!({"age": 20})));

        let mut ids = match recv_query_message(&mut reader).await {
            Control::Q(snapshot) => id_list(&snapshot.value),
            other => panic!("diff before snapshot: {other:?}"),
        };
        while ids.len() < 30 {
            if let Control::Qdiff(diff) = recv_query_message(&mut reader).await {
                apply_id_diffs(&mut ids, &diff.diffs);
            }
        }
        let mut expected: Vec<String> = (1..=30).map(|d: u64| d.to_string()).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_count_query_sends_new_value() {
        let store = store();
        let mut writer = store.connect_local();
        let mut reader = store.connect_local();
        writer.send(Message::Op(add("w", 1, "1", json!({"age": 30}))));
        recv_ack(&mut writer).await;

        let expression = json!({"age": {"$gte": 18}, "$count": true});
        reader.send(qsub("q1", "users", expression.clone()));
        match recv_query_message(&mut reader).await {
            Control::Q(snapshot) => assert_eq!(snapshot.value, json!(1)),
            other => panic!("unexpected {other:?}"),
        }

        writer.send(Message::Op(add("w", 2, "2", json!({"age": 40}))));
        match recv_query_message(&mut reader).await {
            Control::Q(snapshot) => {
                assert_eq!(snapshot.expression, expression);
                assert_eq!(snapshot.value, json!(2));
                assert!(snapshot.ops.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        // Writes that leave the count alone send nothing.
        writer.send(Message::Op(add("w", 3, "3", json!({"age": 10}))));
        recv_ack(&mut writer).await;
        writer.send(Message::Op(add("w", 4, "4", json!({"age": 50}))));
        match recv_query_message(&mut reader).await {
            Control::Q(snapshot) => assert_eq!(snapshot.value, json!(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_query_follows_referenced_doc() {
        let store = store();
        let mut writer = store.connect_local();
        let mut reader = store.connect_local();
        let post = |date, doc_id: &str, author: &str| {
            Operation::new(OpKind::Add, "w", date, "posts", doc_id).with_value(json!({"author": author}))
        };
        writer.send(Message::Op(add("w", 1, "1", json!({"name": "Ann"}))));
        writer.send(Message::Op(post(2, "p1", "Ann")));
        writer.send(Message::Op(post(3, "p2", "Bob")));
        for _ in 0..3 {
            recv_ack(&mut writer).await;
        }

        reader.send(qsub("q1", "posts", json!({"author": "$users.1.name"})));
        let mut ids = match recv_query_message(&mut reader).await {
            Control::Q(snapshot) => id_list(&snapshot.value),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(ids, vec!["p1"]);

        let rename = Operation::new(OpKind::Set, "w", 4, "users", "1")
            .with_field("name")
            .with_value(json!("Bob"));
        writer.send(Message::Op(rename));
        match recv_query_message(&mut reader).await {
            Control::Qdiff(diff) => {
                apply_id_diffs(&mut ids, &diff.diffs);
                assert_eq!(diff.ops.len(), 1);
                assert_eq!(diff.ops[0].doc_id, "p2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ids, vec!["p2"]);
    }

    #[tokio::test]
    async fn test_lagging_bus_reloads_cached_docs() {
        let storage = MemoryStorage::new();
        let bus = Arc::new(MemoryPubSub::new(1));
        let store = Store::new(
            Arc::new(storage.clone()),
            StoreOptions::for_testing().with_pubsub(bus.clone()),
        );
        store.init().await.unwrap();
        let mut writer = store.connect_local();
        let mut reader = store.connect_local();
        writer.send(Message::Op(add("w", 1, "1", json!({"n": 1}))));
        recv_ack(&mut writer).await;
        reader.send(sub("s1", "1"));
        recv_ack(&mut reader).await;

        // Another process commits, but its notification is lost in the lag.
        let stored = storage.get_doc_by_id("users", "1").await.unwrap().unwrap();
        let set = Operation::new(OpKind::Set, "x", 2, "users", "1")
            .with_field("n")
            .with_value(json!(2));
        let mut doc = Document::from_ops("users", "1", stored.ops.clone());
        assert!(doc.apply_op(set.clone()));
        storage
            .save_doc("users", &StoredDoc::from_document(&doc), Some(&stored.version))
            .await
            .unwrap();
        for date in 3..6 {
            let other = Operation::new(OpKind::Add, "x", date, "users", "2").with_value(json!({}));
            bus.publish(&other).unwrap();
        }

        loop {
            if let Message::Op(op) = recv(&mut reader).await {
                if op.id == set.id {
                    break;
                }
            }
        }
        let cached = store.doc("users", "1").unwrap();
        assert_eq!(cached.document().get(), Some(json!({"_id": "1", "n": 2})));
    }

    #[tokio::test]
    async fn test_ops_survive_immediate_unattach() {
        let storage = MemoryStorage::new();
        let options = StoreOptions {
            unattach_grace: Duration::ZERO,
            ..StoreOptions::for_testing()
        };
        let store = Store::new(Arc::new(storage.clone()), options);
        let mut writer = store.connect_local();
        writer.send(Message::Op(add("w", 1, "c", json!({"n": 0}))));
        recv_ack(&mut writer).await;

        for date in 2..=41 {
            let inc = Operation::new(OpKind::Increment, "w", date, "users", "c")
                .with_field("n")
                .with_value(json!(1));
            writer.send(Message::Op(inc));
            let ack = recv_ack(&mut writer).await;
            assert_eq!(ack.error, None);
            // Let the unattach timer run between ops.
            tokio::task::yield_now().await;
        }
        let stored = storage.get_doc_by_id("users", "c").await.unwrap().unwrap();
        assert_eq!(stored.state, Some(json!({"n": 40})));

        let mut reader = store.connect_local();
        reader.send(sub("s1", "c"));
        let ack = recv_ack(&mut reader).await;
        assert_eq!(ack.value, Some(json!("w 41")));
    }

    #[test]
    fn test_sent_ops_bounded() {
        let mut sent = SentOps::default();
        for i in 0..SENT_OPS_CAPACITY + 5 {
            sent.insert(&i.to_string());
        }
        assert_eq!(sent.order.len(), SENT_OPS_CAPACITY);
        assert!(!sent.ids.contains("0"));
        assert!(sent.ids.contains(&(SENT_OPS_CAPACITY + 4).to_string()));
    }
}
