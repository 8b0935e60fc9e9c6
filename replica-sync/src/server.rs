//! WebSocket front end for a [`Store`].
//!
//! Architecture:
//! ```text
//! Client A ──ws──┐
//!                ├── Link ── Store ── ServerDoc / ServerQuery
//! Client B ──ws──┘              │
//!                               ├── Storage (RocksDB or memory)
//!                               └── PubSub (fan-out across stores)
//! ```
//!
//! Each socket is bridged to an in-process [`Link`]: text frames are decoded
//! into [`Message`]s and handed to the store; everything the store sends back
//! is encoded and written to the socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::channel::Link;
use crate::protocol::Message;
use crate::pubsub::MemoryPubSub;
use crate::storage::{MemoryStorage, RocksStorage, Storage, StorageConfig, StorageError};
use crate::store::{Store, StoreOptions};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Capacity of the in-process pub/sub bus
    pub pubsub_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Coalesce document saves (None = save on every operation)
    pub save_debounce: Option<Duration>,
    /// How long unsubscribed docs and queries stay in memory
    pub unattach_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            pubsub_capacity: 1024,
            storage_path: None,
            save_debounce: None,
            unattach_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory storage, short grace period.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            unattach_grace: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// Defaults overridden by `REPLICA_BIND_ADDR`, `REPLICA_STORAGE_PATH`,
    /// `REPLICA_SAVE_DEBOUNCE_MS` and `REPLICA_UNATTACH_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("REPLICA_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.storage_path = std::env::var("REPLICA_STORAGE_PATH").ok().map(PathBuf::from);
        if let Some(ms) = env_millis("REPLICA_SAVE_DEBOUNCE_MS") {
            config.save_debounce = (!ms.is_zero()).then_some(ms);
        }
        if let Some(ms) = env_millis("REPLICA_UNATTACH_MS") {
            config.unattach_grace = ms;
        }
        config
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            log::warn!("Ignoring {name}={raw}: not a number of milliseconds");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    store: Store,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server with the default store options.
    pub fn new(config: ServerConfig) -> Result<Self, StorageError> {
        Self::with_options(config, StoreOptions::default())
    }

    /// Create a server whose store uses `options` (projections, hooks).
    /// Storage, debounce, grace period and the pub/sub bus come from `config`
    /// unless `options` already sets a bus.
    pub fn with_options(config: ServerConfig, options: StoreOptions) -> Result<Self, StorageError> {
        let storage: Arc<dyn Storage> = match &config.storage_path {
            Some(path) => {
                let storage = RocksStorage::open(StorageConfig {
                    path: path.clone(),
                    ..StorageConfig::default()
                })?;
                log::info!("Opened document storage at {}", path.display());
                Arc::new(storage)
            }
            None => Arc::new(MemoryStorage::new()),
        };
        let pubsub = options
            .pubsub
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryPubSub::new(config.pubsub_capacity)));
        let options = StoreOptions {
            save_debounce: config.save_debounce,
            unattach_grace: config.unattach_grace,
            ..options
        }
        .with_pubsub(pubsub);
        Ok(Self {
            store: Store::new(storage, options),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        self.store.init().await?;
        let projections = self.store.projection_hashes();
        if !projections.is_empty() {
            log::info!("Serving projections: {:?}", projections.keys().collect::<Vec<_>>());
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let store = self.store.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, store, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Bridge one WebSocket to the store until either side closes.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        store: Store,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (client, server) = Link::pair();
        let channel_id = store.connect(server);
        let Link { tx: to_store, rx: mut from_store } = client;
        log::info!("WebSocket connection established from {addr} (channel {channel_id})");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match Message::decode(text.as_str()) {
                                Ok(msg) => {
                                    if to_store.send(msg).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    stats.write().await.rejected_frames += 1;
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                // Outgoing message from the store
                outgoing = from_store.recv() => {
                    let Some(msg) = outgoing else {
                        break;
                    };
                    match msg.encode() {
                        Ok(text) => {
                            if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                                log::debug!("Write to {addr} failed: {e}");
                                break;
                            }
                        }
                        Err(e) => log::error!("Dropping {} message to {addr}: {e}", msg.type_name()),
                    }
                }
            }
        }

        // Dropping our sender ends the store's handler for this channel.
        drop(to_store);
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        Ok(())
    }
}
