//! Client-side replica.
//!
//! A [`Model`] keeps a local cache of every collection it touches. Mutations
//! are applied locally first, then sent to the server and acknowledged by
//! operation id. While offline, operations stay in the document log and are
//! replayed by the handshake on the next [`Model::connect`].
//!
//! ```text
//!   add/set/... ─► local Document ─► Change event
//!                        │
//!                 online? ──► Link ─► ack { opId } ─► (error: rollback + Rejected)
//!                        │
//!                 offline ──► kept unacked ─► handshake on reconnect
//! ```

pub mod collection;
pub mod query;
pub mod ws;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use replica_core::query::{join_refs, resolve_joins};
use replica_core::value::get_path;
use replica_core::{
    apply_id_diffs, array_edits, new_source_id, now_ms, query_hash, string_edits, ArrayEdit, Clock, JoinRef,
    OpKind, Operation, QueryOutput, StringEdit,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub use collection::Collection;
pub use query::{Query, QueryStrategy};

use crate::channel::Link;
use crate::protocol::{
    Ack, Control, DocRequest, Handshake, HandshakeDoc, Message, ProtocolError, QueryDiff, QueryRequest,
    QuerySnapshot,
};

#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Writer identity; generated when `None`
    pub source: Option<String>,
    /// Collections whose name starts with this never leave the process
    pub local_prefix: String,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            source: None,
            local_prefix: "_".to_string(),
        }
    }
}

/// Events emitted by the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Handshake completed
    Online,
    /// Connection lost
    Offline,
    /// A cached document changed (local write, remote op or rollback)
    Change { collection_name: String, doc_id: String },
    /// A query's result may have changed
    QueryChange { hash: String },
    /// The server rejected an operation; it has been rolled back
    Rejected { op_id: String, error: String },
}

#[derive(Debug, Clone)]
pub enum ModelError {
    /// Rejected by the server (pre-hook or projection)
    Rejected(String),
    /// Needs a connection
    Offline,
    Protocol(ProtocolError),
    UnknownQuery,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Rejected(e) => write!(f, "Rejected: {e}"),
            ModelError::Offline => write!(f, "Offline"),
            ModelError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ModelError::UnknownQuery => write!(f, "Unknown query"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<ProtocolError> for ModelError {
    fn from(e: ProtocolError) -> Self {
        ModelError::Protocol(e)
    }
}

/// Client-side bookkeeping for one query.
struct QueryEntry {
    collection_name: String,
    expression: Value,
    strategy: QueryStrategy,
    /// Expression with join references resolved, as sent to the server
    resolved: Value,
    resolved_hash: String,
    ids: Vec<String>,
    value: Option<Value>,
    /// A snapshot for `resolved` has arrived
    received: bool,
    subscribers: usize,
}

impl QueryEntry {
    fn depends_on(&self, collection_name: &str, doc_id: &str) -> bool {
        join_refs(&self.expression)
            .iter()
            .any(|r| r.collection_name == collection_name && r.doc_id == doc_id)
    }
}

struct ModelState {
    source: String,
    local_prefix: String,
    clock: Clock,
    collections: HashMap<String, Collection>,
    /// Sent or queued operations without an ack, in creation order
    unacked: Vec<Operation>,
    waiters: HashMap<String, oneshot::Sender<Option<String>>>,
    requests: HashMap<String, oneshot::Sender<Ack>>,
    dates: HashMap<String, oneshot::Sender<u64>>,
    link_tx: Option<mpsc::UnboundedSender<Message>>,
    online: bool,
    /// Bumped on every connect; readers of older links stop handling
    connection: u64,
    queries: HashMap<String, QueryEntry>,
    doc_subs: HashMap<(String, String), usize>,
    projection_hashes: BTreeMap<String, String>,
    event_tx: mpsc::UnboundedSender<ModelEvent>,
}

struct ModelInner {
    state: Mutex<ModelState>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ModelEvent>>>,
}

/// Client replica. Clones share state.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Model {
    pub fn new(options: ModelOptions) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ModelInner {
                state: Mutex::new(ModelState {
                    source: options.source.unwrap_or_else(new_source_id),
                    local_prefix: options.local_prefix,
                    clock: Clock::new(),
                    collections: HashMap::new(),
                    unacked: Vec::new(),
                    waiters: HashMap::new(),
                    requests: HashMap::new(),
                    dates: HashMap::new(),
                    link_tx: None,
                    online: false,
                    connection: 0,
                    queries: HashMap::new(),
                    doc_subs: HashMap::new(),
                    projection_hashes: BTreeMap::new(),
                    event_tx,
                }),
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<ModelEvent>> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn source(&self) -> String {
        self.lock().source.clone()
    }

    /// Connected and handshake acknowledged.
    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn is_local_collection(&self, collection_name: &str) -> bool {
        self.lock().is_local(collection_name)
    }

    /// Operations still waiting for a server ack.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Current skew correction against the server clock, in milliseconds.
    pub fn clock_offset(&self) -> i64 {
        self.lock().clock.offset()
    }

    pub fn get(&self, collection_name: &str, doc_id: &str) -> Option<Value> {
        self.lock().collections.get(collection_name)?.get(doc_id)
    }

    /// Copy of a cached collection.
    pub fn collection(&self, collection_name: &str) -> Option<Collection> {
        self.lock().collections.get(collection_name).cloned()
    }

    pub fn query(&self, collection_name: &str, expression: Value) -> Query {
        Query::new(self.clone(), collection_name, expression)
    }

    /// Attach to a server over `link`: sync clocks, replay unacked operations
    /// and restore subscriptions through one handshake.
    pub async fn connect(&self, link: Link) -> Result<(), ModelError> {
        let Link { tx, mut rx } = link;
        let connection = {
            let mut s = self.lock();
            s.link_tx = Some(tx);
            s.connection += 1;
            s.connection
        };

        let model = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if model.lock().connection != connection {
                    return;
                }
                model.handle_message(msg);
            }
            model.on_closed(connection);
        });

        self.sync_clock().await?;

        let (id, ack_rx, doc_count, op_count) = {
            let mut s = self.lock();
            let handshake = s.handshake();
            let doc_count = handshake.docs.len();
            let op_count: usize = handshake.docs.iter().map(|d| d.ops.len()).sum();
            let id = handshake.id.clone();
            let (ack_tx, ack_rx) = oneshot::channel();
            s.requests.insert(id.clone(), ack_tx);
            s.send(Message::Control(Control::Handshake(handshake)));
            (id, ack_rx, doc_count, op_count)
        };
        if op_count > 0 {
            log::info!("Replaying {op_count} queued operations across {doc_count} documents");
        }
        let ack = ack_rx.await.map_err(|_| ModelError::Offline)?;
        if let Some(error) = ack.error {
            return Err(ModelError::Rejected(error));
        }
        log::debug!("Handshake {id} acknowledged");
        let mut s = self.lock();
        s.online = true;
        s.emit(ModelEvent::Online);
        Ok(())
    }

    /// Drop the connection. Pending operations stay queued.
    pub fn disconnect(&self) {
        let mut s = self.lock();
        s.connection += 1;
        if s.link_tx.take().is_some() {
            s.go_offline();
        }
    }

    async fn sync_clock(&self) -> Result<(), ModelError> {
        let sent = now_ms();
        let id = Uuid::new_v4().to_string();
        let rx = {
            let mut s = self.lock();
            let (tx, rx) = oneshot::channel();
            s.dates.insert(id.clone(), tx);
            s.send(Message::Control(Control::Date { id, value: sent }));
            rx
        };
        let server = rx.await.map_err(|_| ModelError::Offline)?;
        let received = now_ms();
        let offset = server as i64 - (sent / 2 + received / 2) as i64;
        self.lock().clock.set_offset(offset);
        log::debug!("Clock offset against server: {offset}ms");
        Ok(())
    }

    fn on_closed(&self, connection: u64) {
        let mut s = self.lock();
        if s.connection == connection && s.link_tx.is_some() {
            s.link_tx = None;
            s.go_offline();
        }
    }

    pub(crate) fn handle_message(&self, msg: Message) {
        let mut s = self.lock();
        match msg {
            Message::Op(op) => s.apply_remote(vec![op]),
            Message::Control(Control::Ack(ack)) => s.on_ack(ack),
            Message::Control(Control::Ackdate { id, value }) => {
                if let Some(tx) = s.dates.remove(&id) {
                    let _ = tx.send(value);
                }
            }
            Message::Control(Control::Q(snapshot)) => s.on_snapshot(snapshot),
            Message::Control(Control::Qdiff(diff)) => s.on_query_diff(diff),
            Message::Control(Control::Projections { hashes }) => s.on_projections(hashes),
            Message::Control(Control::Sync(req)) => {
                log::trace!("{}/{} at {:?}", req.collection_name, req.doc_id, req.version);
            }
            other => log::debug!("Ignoring {} message", other.type_name()),
        }
    }

    // Mutations

    pub async fn add(&self, collection_name: &str, doc_id: &str, value: Value) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| vec![s.op(OpKind::Add, collection_name, doc_id).with_value(value)])
            .await
    }

    /// Replace the document (`field = None`) or deep-set a field.
    pub async fn set(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: Option<&str>,
        value: Value,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![with_field(s.op(OpKind::Set, collection_name, doc_id), field).with_value(value)]
        })
        .await
    }

    pub async fn del(&self, collection_name: &str, doc_id: &str, field: Option<&str>) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![with_field(s.op(OpKind::Del, collection_name, doc_id), field)]
        })
        .await
    }

    pub async fn increment(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: Option<&str>,
        by: Value,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![with_field(s.op(OpKind::Increment, collection_name, doc_id), field).with_value(by)]
        })
        .await
    }

    pub async fn string_insert(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        text: &str,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s
                .op(OpKind::StringInsert, collection_name, doc_id)
                .with_field(field)
                .with_index(index)
                .with_value(Value::String(text.to_string()))]
        })
        .await
    }

    pub async fn string_remove(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        how_many: usize,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s
                .op(OpKind::StringRemove, collection_name, doc_id)
                .with_field(field)
                .with_index(index)
                .with_how_many(how_many)]
        })
        .await
    }

    /// Turn a string field into `target` with granular insert/remove ops.
    pub async fn string_diff(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        target: &str,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            let current = s.field(collection_name, doc_id, field);
            let Some(Value::String(current)) = current else {
                return vec![s
                    .op(OpKind::StringDiff, collection_name, doc_id)
                    .with_field(field)
                    .with_value(Value::String(target.to_string()))];
            };
            string_edits(&current, target)
                .into_iter()
                .map(|edit| match edit {
                    StringEdit::Remove { index, how_many } => s
                        .op(OpKind::StringRemove, collection_name, doc_id)
                        .with_field(field)
                        .with_index(index)
                        .with_how_many(how_many),
                    StringEdit::Insert { index, text } => s
                        .op(OpKind::StringInsert, collection_name, doc_id)
                        .with_field(field)
                        .with_index(index)
                        .with_value(Value::String(text)),
                })
                .collect()
        })
        .await
    }

    pub async fn push(&self, collection_name: &str, doc_id: &str, field: &str, value: Value) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s.op(OpKind::Push, collection_name, doc_id).with_field(field).with_value(value)]
        })
        .await
    }

    pub async fn pop(&self, collection_name: &str, doc_id: &str, field: &str) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s.op(OpKind::Pop, collection_name, doc_id).with_field(field)]
        })
        .await
    }

    /// Insert `values` at `index`.
    pub async fn insert(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        values: Vec<Value>,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s
                .op(OpKind::Insert, collection_name, doc_id)
                .with_field(field)
                .with_index(index)
                .with_value(Value::Array(values))]
        })
        .await
    }

    pub async fn remove(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        how_many: usize,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s
                .op(OpKind::Remove, collection_name, doc_id)
                .with_field(field)
                .with_index(index)
                .with_how_many(how_many)]
        })
        .await
    }

    /// Move `how_many` elements starting at `from` so they start at `to`.
    pub async fn move_items(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        from: usize,
        how_many: usize,
        to: usize,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s
                .op(OpKind::Move, collection_name, doc_id)
                .with_field(field)
                .with_index(from)
                .with_how_many(how_many)
                .with_to(to)]
        })
        .await
    }

    pub async fn swap(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        index: usize,
        to: usize,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            vec![s
                .op(OpKind::Swap, collection_name, doc_id)
                .with_field(field)
                .with_index(index)
                .with_to(to)]
        })
        .await
    }

    /// Turn an array field into `target` with granular insert/remove ops.
    pub async fn array_diff(
        &self,
        collection_name: &str,
        doc_id: &str,
        field: &str,
        target: Vec<Value>,
    ) -> Result<(), ModelError> {
        self.mutate(collection_name, doc_id, |s| {
            let current = s.field(collection_name, doc_id, field);
            let Some(Value::Array(current)) = current else {
                return vec![s
                    .op(OpKind::ArrayDiff, collection_name, doc_id)
                    .with_field(field)
                    .with_value(Value::Array(target))];
            };
            array_edits(&current, &target)
                .into_iter()
                .map(|edit| match edit {
                    ArrayEdit::Remove { index, how_many } => s
                        .op(OpKind::Remove, collection_name, doc_id)
                        .with_field(field)
                        .with_index(index)
                        .with_how_many(how_many),
                    ArrayEdit::Insert { index, values } => s
                        .op(OpKind::Insert, collection_name, doc_id)
                        .with_field(field)
                        .with_index(index)
                        .with_value(Value::Array(values)),
                })
                .collect()
        })
        .await
    }

    /// Apply locally, then send and wait for the acks when connected.
    /// Offline, the operations are queued and this returns at once.
    async fn mutate(
        &self,
        collection_name: &str,
        doc_id: &str,
        build: impl FnOnce(&mut ModelState) -> Vec<Operation>,
    ) -> Result<(), ModelError> {
        let waiters = {
            let mut s = self.lock();
            let ops = build(&mut s);
            if ops.is_empty() {
                return Ok(());
            }
            s.apply_local(collection_name, doc_id, &ops);
            if s.is_local(collection_name) {
                return Ok(());
            }
            let mut waiters = Vec::new();
            for op in ops {
                s.unacked.push(op.clone());
                if s.link_tx.is_none() {
                    continue;
                }
                let (tx, rx) = oneshot::channel();
                s.waiters.insert(op.id.clone(), tx);
                if s.send(Message::Op(op)) {
                    waiters.push(rx);
                }
            }
            waiters
        };
        for rx in waiters {
            // A dropped waiter means the connection went away; the op stays queued.
            if let Ok(Some(error)) = rx.await {
                return Err(ModelError::Rejected(error));
            }
        }
        Ok(())
    }

    // Document subscriptions

    /// Keep a document in sync. Reference counted; only the first call
    /// subscribes on the server.
    pub async fn subscribe_doc(&self, collection_name: &str, doc_id: &str) -> Result<(), ModelError> {
        let request = {
            let mut s = self.lock();
            let count = {
                let count = s
                    .doc_subs
                    .entry((collection_name.to_string(), doc_id.to_string()))
                    .or_insert(0);
                *count += 1;
                *count
            };
            if count > 1 || s.is_local(collection_name) || s.link_tx.is_none() {
                return Ok(());
            }
            let version = s.doc_version(collection_name, doc_id);
            s.request(|id| {
                Control::Sub(DocRequest {
                    id: Some(id),
                    collection_name: collection_name.to_string(),
                    doc_id: doc_id.to_string(),
                    version: Some(version),
                })
            })
        };
        await_ack(request).await.map(|_| ())
    }

    pub fn unsubscribe_doc(&self, collection_name: &str, doc_id: &str) {
        let mut s = self.lock();
        let key = (collection_name.to_string(), doc_id.to_string());
        let Some(count) = s.doc_subs.get_mut(&key) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        s.doc_subs.remove(&key);
        if !s.is_local(collection_name) {
            s.send(Message::Control(Control::Unsub(DocRequest {
                id: None,
                collection_name: collection_name.to_string(),
                doc_id: doc_id.to_string(),
                version: None,
            })));
        }
    }

    /// Bring one document up to date without subscribing.
    pub async fn fetch_doc(&self, collection_name: &str, doc_id: &str) -> Result<Option<Value>, ModelError> {
        let request = {
            let mut s = self.lock();
            if s.is_local(collection_name) {
                None
            } else {
                let version = s.doc_version(collection_name, doc_id);
                Some(s.request(|id| {
                    Control::Fetch(DocRequest {
                        id: Some(id),
                        collection_name: collection_name.to_string(),
                        doc_id: doc_id.to_string(),
                        version: Some(version),
                    })
                }))
            }
        };
        if let Some(request) = request {
            await_ack(request).await?;
        }
        Ok(self.get(collection_name, doc_id))
    }

    // Queries, driven by `Query`

    pub(crate) fn query_strategy(&self, collection_name: &str, expression: &Value) -> QueryStrategy {
        if self.is_local_collection(collection_name) {
            QueryStrategy::Local
        } else if !join_refs(expression).is_empty() {
            QueryStrategy::Join
        } else {
            QueryStrategy::Remote
        }
    }

    /// Register interest; returns the request to send when this is the first
    /// subscriber (or a fetch).
    pub(crate) fn open_query(
        &self,
        collection_name: &str,
        expression: &Value,
        strategy: QueryStrategy,
        subscribe: bool,
    ) -> Option<PendingRequest> {
        let mut s = self.lock();
        let hash = query_hash(collection_name, expression);
        let resolved = s.resolve(expression);
        let entry = s.queries.entry(hash).or_insert_with(|| QueryEntry {
            collection_name: collection_name.to_string(),
            expression: expression.clone(),
            strategy,
            resolved_hash: query_hash(collection_name, &resolved),
            resolved,
            ids: Vec::new(),
            value: None,
            received: false,
            subscribers: 0,
        });
        if subscribe {
            entry.subscribers += 1;
            if entry.subscribers > 1 {
                return None;
            }
        }
        if strategy == QueryStrategy::Local || s.link_tx.is_none() {
            return None;
        }
        let req = s.query_request(collection_name, expression);
        Some(s.request(|id| {
            let req = QueryRequest { id: Some(id), ..req };
            if subscribe {
                Control::Qsub(req)
            } else {
                Control::Qfetch(req)
            }
        }))
    }

    pub(crate) fn close_query(&self, collection_name: &str, expression: &Value) -> bool {
        let mut s = self.lock();
        let hash = query_hash(collection_name, expression);
        let Some(entry) = s.queries.get_mut(&hash) else {
            return false;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return true;
        }
        let local = entry.strategy == QueryStrategy::Local;
        let resolved = entry.resolved.clone();
        s.queries.remove(&hash);
        if !local {
            s.send(Message::Control(Control::Qunsub(QueryRequest {
                id: None,
                collection_name: collection_name.to_string(),
                expression: resolved,
                doc_versions: BTreeMap::new(),
            })));
        }
        true
    }

    /// Current result: the server's when it has answered and we are
    /// connected, otherwise evaluated over the local cache.
    pub(crate) fn query_output(&self, collection_name: &str, expression: &Value) -> QueryOutput {
        let s = self.lock();
        let hash = query_hash(collection_name, expression);
        let entry = s.queries.get(&hash);
        let collection = s.collections.get(collection_name);
        match entry {
            Some(entry) if entry.received && s.link_tx.is_some() && entry.strategy != QueryStrategy::Local => {
                match &entry.value {
                    Some(value) => QueryOutput::Value(value.clone()),
                    None => QueryOutput::Docs(
                        entry
                            .ids
                            .iter()
                            .filter_map(|id| collection.and_then(|c| c.get(id)))
                            .collect(),
                    ),
                }
            }
            _ => {
                let resolved = s.resolve(expression);
                match collection {
                    Some(c) => c.evaluate(&resolved),
                    None => replica_core::evaluate(&resolved, Vec::new()),
                }
            }
        }
    }
}

/// Request registered with the model, waiting for its ack.
pub(crate) type PendingRequest = Option<oneshot::Receiver<Ack>>;

pub(crate) async fn await_ack(request: PendingRequest) -> Result<Ack, ModelError> {
    let rx = request.ok_or(ModelError::Offline)?;
    let ack = rx.await.map_err(|_| ModelError::Offline)?;
    match ack.error {
        Some(error) => Err(ModelError::Rejected(error)),
        None => Ok(ack),
    }
}

fn with_field(op: Operation, field: Option<&str>) -> Operation {
    match field {
        Some(field) => op.with_field(field),
        None => op,
    }
}

impl ModelState {
    fn emit(&self, event: ModelEvent) {
        let _ = self.event_tx.send(event);
    }

    fn is_local(&self, collection_name: &str) -> bool {
        collection_name.starts_with(&self.local_prefix)
    }

    fn send(&self, msg: Message) -> bool {
        self.link_tx.as_ref().is_some_and(|tx| tx.send(msg).is_ok())
    }

    fn request(&mut self, build: impl FnOnce(String) -> Control) -> PendingRequest {
        self.link_tx.as_ref()?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.requests.insert(id.clone(), tx);
        if self.send(Message::Control(build(id.clone()))) {
            Some(rx)
        } else {
            self.requests.remove(&id);
            None
        }
    }

    fn op(&mut self, kind: OpKind, collection_name: &str, doc_id: &str) -> Operation {
        let date = self.clock.next();
        Operation::new(kind, self.source.clone(), date, collection_name, doc_id)
    }

    fn collection_mut(&mut self, collection_name: &str) -> &mut Collection {
        let local = self.is_local(collection_name);
        self.collections
            .entry(collection_name.to_string())
            .or_insert_with(|| Collection::new(collection_name, local))
    }

    fn field(&self, collection_name: &str, doc_id: &str, field: &str) -> Option<Value> {
        self.collections
            .get(collection_name)?
            .doc(doc_id)?
            .get_field(field)
    }

    fn doc_version(&self, collection_name: &str, doc_id: &str) -> replica_core::VersionVector {
        self.collections
            .get(collection_name)
            .and_then(|c| c.doc(doc_id))
            .map(|d| d.version())
            .unwrap_or_default()
    }

    fn has_unacked(&self, collection_name: &str, doc_id: &str) -> bool {
        self.unacked
            .iter()
            .any(|op| op.collection_name == collection_name && op.doc_id == doc_id)
    }

    fn apply_local(&mut self, collection_name: &str, doc_id: &str, ops: &[Operation]) {
        let doc = self.collection_mut(collection_name).doc_mut(doc_id);
        for op in ops {
            doc.apply_op(op.clone());
        }
        self.changed(collection_name, doc_id);
    }

    /// Merge operations from the server, one change event per document.
    fn apply_remote(&mut self, ops: Vec<Operation>) {
        let mut touched = BTreeSet::new();
        for op in ops {
            let key = (op.collection_name.clone(), op.doc_id.clone());
            if self.collection_mut(&key.0).doc_mut(&key.1).apply_op(op) {
                touched.insert(key);
            }
        }
        for (collection_name, doc_id) in touched {
            if !self.has_unacked(&collection_name, &doc_id) {
                self.collection_mut(&collection_name).doc_mut(&doc_id).distill();
            }
            self.changed(&collection_name, &doc_id);
        }
    }

    /// Emit `Change`, re-resolve dependent join queries and notify queries
    /// answered from the local cache.
    fn changed(&mut self, collection_name: &str, doc_id: &str) {
        self.emit(ModelEvent::Change {
            collection_name: collection_name.to_string(),
            doc_id: doc_id.to_string(),
        });
        self.refresh_joins(collection_name, doc_id);
        let connected = self.link_tx.is_some();
        for (hash, entry) in &self.queries {
            let served = connected && entry.received && entry.strategy != QueryStrategy::Local;
            if entry.collection_name == collection_name && entry.subscribers > 0 && !served {
                self.emit(ModelEvent::QueryChange { hash: hash.clone() });
            }
        }
    }

    fn refresh_joins(&mut self, collection_name: &str, doc_id: &str) {
        let dependent: Vec<String> = self
            .queries
            .iter()
            .filter(|(_, e)| e.strategy == QueryStrategy::Join && e.depends_on(collection_name, doc_id))
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in dependent {
            let Some(entry) = self.queries.get(&hash) else {
                continue;
            };
            let resolved = self.resolve(&entry.expression);
            let resolved_hash = query_hash(&entry.collection_name, &resolved);
            if resolved_hash == entry.resolved_hash {
                continue;
            }
            let (collection_name, old, subscribed) =
                (entry.collection_name.clone(), entry.resolved.clone(), entry.subscribers > 0);
            if let Some(entry) = self.queries.get_mut(&hash) {
                entry.resolved = resolved.clone();
                entry.resolved_hash = resolved_hash;
                entry.ids.clear();
                entry.value = None;
                entry.received = false;
            }
            log::debug!("Join query {hash} now resolves to {resolved}");
            if subscribed {
                self.send(Message::Control(Control::Qunsub(QueryRequest {
                    id: None,
                    collection_name: collection_name.clone(),
                    expression: old,
                    doc_versions: BTreeMap::new(),
                })));
                self.send(Message::Control(Control::Qsub(QueryRequest {
                    id: None,
                    collection_name,
                    expression: resolved,
                    doc_versions: BTreeMap::new(),
                })));
            }
            self.emit(ModelEvent::QueryChange { hash });
        }
    }

    /// Resolve join references against the local cache.
    fn resolve(&self, expression: &Value) -> Value {
        let lookup = |r: &JoinRef| {
            let state = self.collections.get(&r.collection_name)?.get(&r.doc_id)?;
            get_path(&state, &r.field).cloned()
        };
        resolve_joins(expression, &lookup)
    }

    fn query_request(&self, collection_name: &str, expression: &Value) -> QueryRequest {
        let hash = query_hash(collection_name, expression);
        let (resolved, ids) = match self.queries.get(&hash) {
            Some(entry) => (entry.resolved.clone(), entry.ids.clone()),
            None => (self.resolve(expression), Vec::new()),
        };
        let collection = self.collections.get(collection_name);
        let doc_versions = ids
            .iter()
            .filter_map(|id| Some((id.clone(), collection?.doc(id)?.version())))
            .collect();
        QueryRequest {
            id: None,
            collection_name: collection_name.to_string(),
            expression: resolved,
            doc_versions,
        }
    }

    fn entry_for(&mut self, collection_name: &str, expression: &Value) -> Option<(&String, &mut QueryEntry)> {
        let hash = query_hash(collection_name, expression);
        self.queries
            .iter_mut()
            .find(|(_, e)| e.collection_name == collection_name && e.resolved_hash == hash)
    }

    fn on_snapshot(&mut self, snapshot: QuerySnapshot) {
        self.apply_remote(snapshot.ops);
        let Some((hash, entry)) = self.entry_for(&snapshot.collection_name, &snapshot.expression) else {
            log::debug!("Snapshot for unknown query on {}", snapshot.collection_name);
            return;
        };
        match snapshot.value {
            Value::Array(ids) if replica_core::query::returns_docs(&entry.resolved) => {
                entry.ids = ids.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
                entry.value = None;
            }
            value => entry.value = Some(value),
        }
        entry.received = true;
        let hash = hash.clone();
        self.emit(ModelEvent::QueryChange { hash });
    }

    fn on_query_diff(&mut self, diff: QueryDiff) {
        self.apply_remote(diff.ops);
        let Some((hash, entry)) = self.entry_for(&diff.collection_name, &diff.expression) else {
            log::debug!("Diff for unknown query on {}", diff.collection_name);
            return;
        };
        apply_id_diffs(&mut entry.ids, &diff.diffs);
        let hash = hash.clone();
        self.emit(ModelEvent::QueryChange { hash });
    }

    fn on_ack(&mut self, ack: Ack) {
        let Some(op_id) = ack.op_id.clone() else {
            if let Some(tx) = ack.id.clone().and_then(|id| self.requests.remove(&id)) {
                let _ = tx.send(ack);
            }
            return;
        };
        let op = self
            .unacked
            .iter()
            .position(|o| o.id == op_id)
            .map(|pos| self.unacked.remove(pos));
        match (&ack.error, op) {
            (Some(error), op) => {
                log::info!("Operation {op_id} rejected: {error}");
                if let Some(op) = op {
                    self.collection_mut(&op.collection_name)
                        .doc_mut(&op.doc_id)
                        .remove_op(&op.id);
                    self.changed(&op.collection_name, &op.doc_id);
                }
                self.emit(ModelEvent::Rejected {
                    op_id: op_id.clone(),
                    error: error.clone(),
                });
            }
            (None, Some(op)) => {
                if !self.has_unacked(&op.collection_name, &op.doc_id) {
                    self.collection_mut(&op.collection_name).doc_mut(&op.doc_id).distill();
                }
            }
            (None, None) => {}
        }
        if let Some(tx) = self.waiters.remove(&op_id) {
            let _ = tx.send(ack.error);
        }
    }

    /// Purge collections whose projection definition changed.
    fn on_projections(&mut self, hashes: BTreeMap<String, String>) {
        let names: BTreeSet<String> = hashes
            .keys()
            .chain(self.projection_hashes.keys())
            .cloned()
            .collect();
        for name in names {
            if hashes.get(&name) == self.projection_hashes.get(&name) {
                continue;
            }
            let pending: BTreeSet<String> = self
                .unacked
                .iter()
                .filter(|op| op.collection_name == name)
                .map(|op| op.doc_id.clone())
                .collect();
            if let Some(collection) = self.collections.get_mut(&name) {
                let purged = collection.purge(|id| pending.contains(id));
                log::info!("Projection {name} changed, purged {purged} cached documents");
            }
            for entry in self.queries.values_mut().filter(|e| e.collection_name == name) {
                entry.ids.clear();
                entry.value = None;
                entry.received = false;
            }
        }
        self.projection_hashes = hashes;
    }

    fn handshake(&self) -> Handshake {
        let mut pending: BTreeMap<(String, String), Vec<Operation>> = BTreeMap::new();
        for op in &self.unacked {
            pending
                .entry((op.collection_name.clone(), op.doc_id.clone()))
                .or_default()
                .push(op.clone());
        }
        let keys: BTreeSet<(String, String)> = pending
            .keys()
            .cloned()
            .chain(self.doc_subs.keys().cloned())
            .collect();
        let docs = keys
            .into_iter()
            .filter(|(c, _)| !self.is_local(c))
            .map(|(collection_name, doc_id)| {
                let mut ops = pending.remove(&(collection_name.clone(), doc_id.clone())).unwrap_or_default();
                ops.sort_by(|a, b| a.fold_order(b));
                HandshakeDoc {
                    version: self.doc_version(&collection_name, &doc_id),
                    subscribed: self
                        .doc_subs
                        .contains_key(&(collection_name.clone(), doc_id.clone())),
                    collection_name,
                    doc_id,
                    ops,
                }
            })
            .collect();
        let queries = self
            .queries
            .values()
            .filter(|e| e.subscribers > 0 && e.strategy != QueryStrategy::Local)
            .map(|e| self.query_request(&e.collection_name, &e.expression))
            .collect();
        Handshake {
            id: Uuid::new_v4().to_string(),
            docs,
            queries,
            projection_hashes: self.projection_hashes.clone(),
        }
    }

    fn go_offline(&mut self) {
        self.online = false;
        // Waiting callers see the dropped sender and treat their ops as queued.
        self.waiters.clear();
        self.requests.clear();
        self.dates.clear();
        for entry in self.queries.values_mut() {
            entry.received = false;
        }
        log::info!("Disconnected, {} operations queued", self.unacked.len());
        self.emit(ModelEvent::Offline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> Model {
        Model::new(ModelOptions {
            source: Some("me".into()),
            ..ModelOptions::default()
        })
    }

    #[tokio::test]
    async fn test_offline_mutations_apply_locally() {
        let m = model();
        let mut events = m.take_event_rx().unwrap();
        m.add("users", "1", json!({"name": "Ann"})).await.unwrap();
        m.set("users", "1", Some("age"), json!(30)).await.unwrap();
        m.increment("users", "1", Some("visits"), json!(2)).await.unwrap();

        assert_eq!(
            m.get("users", "1"),
            Some(json!({"_id": "1", "name": "Ann", "age": 30, "visits": 2}))
        );
        assert_eq!(m.unacked_count(), 3);
        assert_eq!(
            events.recv().await,
            Some(ModelEvent::Change {
                collection_name: "users".into(),
                doc_id: "1".into()
            })
        );
        assert!(m.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_local_collection_never_queued() {
        let m = model();
        m.add("_drafts", "1", json!({"text": "hi"})).await.unwrap();
        assert_eq!(m.unacked_count(), 0);
        assert!(m.is_local_collection("_drafts"));
        assert_eq!(m.query("_drafts", json!({})).strategy(), QueryStrategy::Local);
    }

    #[tokio::test]
    async fn test_string_and_array_diff_emit_granular_ops() {
        let m = model();
        m.add("notes", "1", json!({"text": "hello world", "tags": ["a", "b", "c"]}))
            .await
            .unwrap();
        m.string_diff("notes", "1", "text", "hello there world").await.unwrap();
        m.array_diff("notes", "1", "tags", vec![json!("a"), json!("c"), json!("d")])
            .await
            .unwrap();

        let doc = m.get("notes", "1").unwrap();
        assert_eq!(doc["text"], json!("hello there world"));
        assert_eq!(doc["tags"], json!(["a", "c", "d"]));
        let collection = m.collection("notes").unwrap();
        let kinds: Vec<OpKind> = collection.doc("1").unwrap().ops().iter().map(|o| o.kind).collect();
        assert!(kinds.contains(&OpKind::StringInsert));
        assert!(kinds.contains(&OpKind::Remove));
        assert!(!kinds.contains(&OpKind::StringDiff));
    }

    #[tokio::test]
    async fn test_array_ops() {
        let m = model();
        m.add("lists", "1", json!({"items": [1, 2, 3]})).await.unwrap();
        m.push("lists", "1", "items", json!(4)).await.unwrap();
        m.move_items("lists", "1", "items", 0, 1, 3).await.unwrap();
        m.swap("lists", "1", "items", 0, 1).await.unwrap();
        m.pop("lists", "1", "items").await.unwrap();
        assert_eq!(m.get("lists", "1").unwrap()["items"], json!([3, 2, 4]));
    }

    #[test]
    fn test_rejected_ack_rolls_back() {
        let m = model();
        let mut events = m.take_event_rx().unwrap();
        let op = {
            let mut s = m.lock();
            let op = s.op(OpKind::Set, "users", "1").with_field("age").with_value(json!(5));
            s.apply_local("users", "1", std::slice::from_ref(&op));
            s.unacked.push(op.clone());
            op
        };
        assert_eq!(m.get("users", "1"), Some(json!({"_id": "1", "age": 5})));

        m.handle_message(Message::ack_op(op.id.clone(), Some("nope".into())));
        assert_eq!(m.get("users", "1"), None);
        assert_eq!(m.unacked_count(), 0);

        let mut rejected = false;
        while let Ok(event) = events.try_recv() {
            rejected |= event
                == ModelEvent::Rejected {
                    op_id: op.id.clone(),
                    error: "nope".into(),
                };
        }
        assert!(rejected);
    }

    #[test]
    fn test_remote_ops_merge_and_distill() {
        let m = model();
        let add = Operation::new(OpKind::Add, "other", 1, "users", "1").with_value(json!({"n": 1}));
        let set = Operation::new(OpKind::Set, "other", 2, "users", "1")
            .with_field("n")
            .with_value(json!(2));
        m.handle_message(Message::Op(add.clone()));
        m.handle_message(Message::Op(set));
        m.handle_message(Message::Op(add));
        assert_eq!(m.get("users", "1"), Some(json!({"_id": "1", "n": 2})));
        // The older set-less add stays; nothing else to drop.
        assert_eq!(m.collection("users").unwrap().doc("1").unwrap().ops().len(), 2);
    }

    #[test]
    fn test_handshake_orders_pending_ops() {
        let m = model();
        {
            let mut s = m.lock();
            for (kind, field) in [(OpKind::Add, None), (OpKind::Set, Some("a")), (OpKind::Del, Some("b"))] {
                let op = with_field(s.op(kind, "users", "1"), field);
                s.apply_local("users", "1", std::slice::from_ref(&op));
                s.unacked.push(op);
            }
        }
        let handshake = m.lock().handshake();
        assert_eq!(handshake.docs.len(), 1);
        let kinds: Vec<OpKind> = handshake.docs[0].ops.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OpKind::Add, OpKind::Set, OpKind::Del]);
        assert!(!handshake.docs[0].subscribed);
    }

    #[test]
    fn test_projection_change_purges_cache() {
        let m = model();
        m.handle_message(Message::Op(
            Operation::new(OpKind::Add, "other", 1, "users", "1").with_value(json!({"email": "a@b"})),
        ));
        m.handle_message(Message::Control(Control::Projections {
            hashes: BTreeMap::from([("users".to_string(), "users:auths:+email".to_string())]),
        }));
        assert_eq!(m.get("users", "1"), None);

        // Same hash again: nothing purged.
        m.handle_message(Message::Op(
            Operation::new(OpKind::Add, "other", 2, "users", "2").with_value(json!({})),
        ));
        m.handle_message(Message::Control(Control::Projections {
            hashes: BTreeMap::from([("users".to_string(), "users:auths:+email".to_string())]),
        }));
        assert!(m.get("users", "2").is_some());
    }

    #[tokio::test]
    async fn test_subscribe_offline_is_counted() {
        let m = model();
        m.subscribe_doc("users", "1").await.unwrap();
        m.subscribe_doc("users", "1").await.unwrap();
        m.unsubscribe_doc("users", "1");
        assert_eq!(m.lock().handshake().docs.len(), 1);
        m.unsubscribe_doc("users", "1");
        assert!(m.lock().handshake().docs.is_empty());
    }

    #[test]
    fn test_model_error_display() {
        assert_eq!(ModelError::Rejected("x".into()).to_string(), "Rejected: x");
        assert_eq!(ModelError::Offline.to_string(), "Offline");
    }
}
