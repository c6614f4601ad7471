use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use kiln_core::job_events::MSG_TYPE_SYSTEM_STATUS;
use kiln_core::types::JobId;
use serde::Serialize;

use crate::error::AppResult;
use crate::state::AppState;
use crate::ws::manager::WsManager;

/// Topic name for system-status relays.
pub const SYSTEM_TOPIC: &str = "system";

/// Encode one event as a `{ "type", "data" }` text frame.
pub fn encode_event<T: Serialize>(msg_type: &str, data: &T) -> Option<Message> {
    let payload = serde_json::json!({ "type": msg_type, "data": data });
    match serde_json::to_string(&payload) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(msg_type, error = %e, "Failed to encode WebSocket event");
            None
        }
    }
}

/// GET /ws/jobs/{id}
///
/// Relays the job's snapshot and live progress events, then closes after
/// the final event. Unknown jobs are rejected with 404 before the upgrade.
pub async fn job_events_ws(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let job_id = JobId::new(id);
    let subscription = state.service.subscribe(&job_id).await?;

    let events = subscription
        .into_stream()
        .filter_map(|event| async move { encode_event(event.message_type(), &event) })
        .boxed();

    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state.ws_manager, job_id.to_string(), events)
    }))
}

/// GET /ws/system
///
/// Relays the current aggregate, then one aggregate per status interval.
pub async fn system_status_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let events = state
        .service
        .subscribe_system()
        .into_stream()
        .filter_map(|status| async move { encode_event(MSG_TYPE_SYSTEM_STATUS, &status) })
        .boxed();

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state.ws_manager, SYSTEM_TOPIC.to_string(), events)
    })
}

/// Manage a single relay connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with `WsManager` (heartbeats, shutdown).
///   2. Spawns a sender task that forwards control frames and events; it
///      closes the socket once the event stream ends.
///   3. Drains inbound frames on the current task until either side closes.
///   4. Cleans up on disconnect.
async fn handle_socket(
    socket: WebSocket,
    ws_manager: Arc<WsManager>,
    topic: String,
    mut events: BoxStream<'static, Message>,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let mut control = ws_manager.add(conn_id.clone(), topic.clone()).await;
    let watchers = ws_manager.topic_count(&topic).await;
    tracing::info!(conn_id = %conn_id, topic = %topic, watchers, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = control.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                event = events.next() => event.unwrap_or(Message::Close(None)),
            };
            let closing = matches!(frame, Message::Close(_));
            if sink.send(frame).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!(conn_id = %conn_id, "Pong received");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    send_task.abort();
    match ws_manager.remove(&conn_id).await {
        Some(conn) => {
            let connected_secs = (chrono::Utc::now() - conn.connected_at).num_seconds();
            tracing::info!(
                conn_id = %conn_id,
                topic = %conn.topic,
                connected_secs,
                "WebSocket disconnected",
            );
        }
        // Already dropped by shutdown_all.
        None => tracing::info!(conn_id = %conn_id, "WebSocket disconnected"),
    }
}
