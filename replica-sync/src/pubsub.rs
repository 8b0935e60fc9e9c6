//! Cross-process invalidation bus.
//!
//! Every operation a [`Store`](crate::store::Store) commits is published so
//! that other stores sharing the same storage can refresh their in-memory
//! documents and queries. Delivery is at-least-once; receivers de-duplicate.
//!
//! [`MemoryPubSub`] fans out through a tokio broadcast channel. Operations
//! are encoded once and shared as `Arc<str>`. A lagging receiver loses the
//! oldest frames instead of blocking the publisher, and is told so with
//! [`PubSubEvent::Lagged`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use replica_core::Operation;
use tokio::sync::broadcast;

use crate::protocol::ProtocolError;

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PubSubStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

pub trait PubSub: Send + Sync {
    /// Publish an operation. Returns the number of receivers reached.
    fn publish(&self, op: &Operation) -> Result<usize, ProtocolError>;

    /// A fresh receiver for operations published from now on.
    fn subscribe(&self) -> PubSubReceiver;
}

/// What a receiver observed on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubEvent {
    Op(Operation),
    /// The receiver fell behind and this many operations were lost. Cached
    /// state may be stale and must be reloaded from storage.
    Lagged(u64),
}

/// Receiving end of a bus subscription.
pub struct PubSubReceiver {
    rx: broadcast::Receiver<Arc<str>>,
    stats: Arc<AtomicPubSubStats>,
}

impl PubSubReceiver {
    /// Next event, or `None` once the bus is gone. Undecodable frames are
    /// logged and skipped.
    pub async fn recv(&mut self) -> Option<PubSubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => match serde_json::from_str::<Operation>(&frame) {
                    Ok(op) => return Some(PubSubEvent::Op(op)),
                    Err(e) => log::warn!("Dropping undecodable pub/sub frame: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Pub/sub receiver lagged, {n} operations dropped");
                    return Some(PubSubEvent::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Lock-free counters shared by the bus and its receivers.
struct AtomicPubSubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// In-process bus. Clones share one channel.
#[derive(Clone)]
pub struct MemoryPubSub {
    sender: broadcast::Sender<Arc<str>>,
    capacity: usize,
    stats: Arc<AtomicPubSubStats>,
}

impl MemoryPubSub {
    /// `capacity` is how many operations each receiver buffers before it
    /// starts dropping.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicPubSubStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PubSub for MemoryPubSub {
    fn publish(&self, op: &Operation) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = serde_json::to_string(op)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?
            .into();
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    fn subscribe(&self) -> PubSubReceiver {
        PubSubReceiver {
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }
}
