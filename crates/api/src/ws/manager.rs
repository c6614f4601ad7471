use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::Message;
use kiln_core::types::Timestamp;
use tokio::sync::{mpsc, RwLock};

/// Channel sender half for pushing control frames to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Metadata for a single WebSocket relay.
pub struct WsConnection {
    /// What the connection relays: a job id, or `system`.
    pub topic: String,
    /// Channel sender for outbound frames to this connection.
    pub sender: WsSender,
    pub connected_at: Timestamp,
}

/// Tracks open WebSocket relays so heartbeats and shutdown can reach them.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application.
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiver half of the control channel so the caller can
    /// forward its frames to the WebSocket sink.
    pub async fn add(&self, conn_id: String, topic: String) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection {
            topic,
            sender: tx,
            connected_at: chrono::Utc::now(),
        };
        self.connections.write().await.insert(conn_id, conn);
        rx
    }

    /// Forget a connection, returning its metadata if it was registered.
    pub async fn remove(&self, conn_id: &str) -> Option<WsConnection> {
        self.connections.write().await.remove(conn_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of connections relaying `topic`.
    pub async fn topic_count(&self, topic: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.topic == topic)
            .count()
    }

    /// Send a Ping frame to every connection. Closed channels are skipped;
    /// their relays remove themselves.
    pub async fn ping_all(&self) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }

    /// Send a Close frame to every connection and forget them.
    pub async fn shutdown_all(&self) {
        let mut connections = self.connections.write().await;
        for (conn_id, conn) in connections.drain() {
            if conn.sender.send(Message::Close(None)).is_err() {
                tracing::debug!(conn_id = %conn_id, "WebSocket already gone at shutdown");
            }
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
