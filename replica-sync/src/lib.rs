//! # replica-sync — Op-log replication between clients and a store
//!
//! Clients mutate documents optimistically and stream operations to an
//! authoritative store, which persists them, fans them out to subscribers
//! and keeps live queries current.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Model       │ ◄─────────────────► │ SyncServer  │
//! │ (per client)│     JSON frames     │             │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Collections │                     │ Store       │
//! │ (op logs)   │                     │ docs/queries│
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Storage/PubSub│
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire messages (JSON, one message per frame)
//! - [`channel`] — In-process message links
//! - [`session`] — Per-connection subscription bookkeeping
//! - [`store`] — Server documents, live queries, projections and dispatch
//! - [`storage`] — Persistence with optimistic concurrency (RocksDB, memory)
//! - [`pubsub`] — Operation fan-out between stores
//! - [`server`] — WebSocket front end
//! - [`client`] — Client model, queries and transport

pub mod channel;
pub mod client;
pub mod protocol;
pub mod pubsub;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use channel::{Channel, ChannelId, Link};
pub use client::{Collection, Model, ModelError, ModelEvent, ModelOptions, Query, QueryStrategy};
pub use protocol::{
    Ack, Control, DocRequest, Handshake, HandshakeDoc, Message, ProtocolError, QueryDiff, QueryRequest,
    QuerySnapshot,
};
pub use pubsub::{MemoryPubSub, PubSub, PubSubEvent, PubSubReceiver, PubSubStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::ChannelSession;
pub use storage::{
    DocumentMetadata, MemoryStorage, QueryResult, RocksStorage, Storage, StorageConfig, StorageError, StoredDoc,
};
pub use store::{AfterHook, HookContext, PreHook, ServerDoc, ServerQuery, Store, StoreOptions};
