//! WebSocket transport for [`Model::connect`](super::Model::connect).

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::channel::Link;
use crate::protocol::{Message, ProtocolError};

/// Open a WebSocket to `url` and expose it as a [`Link`].
///
/// Spawns a writer task (encode, send text frames) and a reader task (decode
/// text frames). The link closes when either side of the socket does.
pub async fn connect(url: &str) -> Result<Link, ProtocolError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
        log::warn!("Failed to connect to {url}: {e}");
        ProtocolError::ConnectionClosed
    })?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: forward outgoing messages to the socket
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Dropping {} message: {e}", msg.type_name());
                    continue;
                }
            };
            if ws_writer.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Reader task: decode incoming frames
    let url = url.to_string();
    tokio::spawn(async move {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match Message::decode(text.as_str()) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to decode message from {url}: {e}"),
                },
                Ok(WsMessage::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        log::debug!("Connection to {url} closed");
    });

    Ok(Link { tx: out_tx, rx: in_rx })
}
