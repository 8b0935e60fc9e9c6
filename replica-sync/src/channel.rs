//! Message channels between a client model and a server store.
//!
//! A [`Link`] is one end of an ordered, in-order message pipe. The WebSocket
//! transport and the in-process [`Link::pair`] both produce links, so models
//! and stores never see the transport.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::protocol::Message;

/// Process-unique connection id.
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Sending half of a connection, as held by server-side stores.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Channel {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: next_channel_id(),
            tx,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue a message. Returns `false` once the other side is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a bidirectional message pipe.
///
/// `rx` yields `None` once the peer has closed.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::UnboundedSender<Message>,
    pub rx: mpsc::UnboundedReceiver<Message>,
}

impl Link {
    /// Two connected ends.
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }

    pub fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}
