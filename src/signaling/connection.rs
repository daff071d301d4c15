// src/signaling/connection.rs
//! WebSocket connection driver
//!
//! One task per connection reads frames and hands them to the hub; a writer
//! task drains the connection's outbound queue. The [`ConnectionGuard`]
//! detaches the connection from the hub on every exit path.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::hub::{ConnectionId, Flow, SignalingHub};
use super::messages::Outbound;

/// Time allowed to flush queued messages once the reader stops
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Detaches a connection from the hub when dropped
pub struct ConnectionGuard {
    hub: Arc<SignalingHub>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn attach(hub: Arc<SignalingHub>, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        let id = hub.connect(tx);
        Self { hub, id }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}

/// Drive one signaling connection until it closes, errors, or idles out
pub async fn serve_socket(hub: Arc<SignalingHub>, socket: WebSocket, idle_timeout: Duration) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let guard = ConnectionGuard::attach(hub.clone(), tx);

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize signaling message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let frame = match tokio::time::timeout(idle_timeout, ws_rx.next()).await {
            Err(_) => {
                info!("Signaling connection {:?} idle for {:?}, closing", guard.id(), idle_timeout);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("Signaling connection {:?} read error: {}", guard.id(), e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let flow = match frame {
            Message::Text(text) => hub.handle_text(guard.id(), &text),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => hub.handle_text(guard.id(), text),
                Err(_) => Flow::Close,
            },
            Message::Close(_) => Flow::Close,
            // Pings are answered by the WebSocket layer
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
        };

        if flow == Flow::Close {
            break;
        }
    }

    // Detaching drops the hub's sender, which ends the writer once drained
    drop(guard);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}
