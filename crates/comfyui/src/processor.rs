//! WebSocket listener feeding the [`ProgressTracker`].
//!
//! Reads frames from the ComfyUI socket, parses them into typed
//! [`ComfyUIMessage`] variants and records prompt progress. Terminal
//! outcomes are read from history by the gateway, so the listener only
//! ever affects the reported percentage.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIStream};
use crate::messages::{parse_message, ComfyUIMessage};
use crate::reconnect::{reconnect_loop, ReconnectConfig};
use crate::tracker::ProgressTracker;

/// Connect, process messages, reconnect on drop. Runs until `cancel` fires.
pub async fn run_listener(
    client: &ComfyUIClient,
    tracker: &ProgressTracker,
    reconnect: &ReconnectConfig,
    cancel: &CancellationToken,
) {
    let mut stream = match client.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Connection failed, entering reconnect loop");
            match reconnect_loop(|| client.connect(), reconnect, cancel).await {
                Some(stream) => stream,
                None => return,
            }
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = process_messages(&mut stream, tracker) => {}
        }

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!(ws_url = client.ws_url(), "Connection lost, entering reconnect loop");
        stream = match reconnect_loop(|| client.connect(), reconnect, cancel).await {
            Some(stream) => stream,
            None => return,
        };
    }
}

/// Process frames until the socket closes or errors.
pub async fn process_messages(ws_stream: &mut ComfyUIStream, tracker: &ProgressTracker) {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => handle_text_message(&text, tracker),
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Apply one text frame to the tracker.
pub fn handle_text_message(text: &str, tracker: &ProgressTracker) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping unmodelled ComfyUI message");
            return;
        }
    };

    match msg {
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution started");
            tracker.started(&data.prompt_id);
        }
        ComfyUIMessage::Executing(data) => match (data.node, data.prompt_id) {
            (Some(_), Some(prompt_id)) => tracker.started(&prompt_id),
            (None, Some(prompt_id)) => tracker.finished(&prompt_id),
            _ => {}
        },
        ComfyUIMessage::Progress(data) => {
            tracker.record(data.prompt_id.as_deref(), data.percent());
        }
        ComfyUIMessage::ExecutionSuccess(data) | ComfyUIMessage::ExecutionInterrupted(data) => {
            tracker.finished(&data.prompt_id);
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            tracker.finished(&data.prompt_id);
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::trace!(prompt_id = %data.prompt_id, nodes = data.nodes.len(), "Execution used cache");
        }
        ComfyUIMessage::Status(data) => {
            tracing::trace!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_frames_update_tracker() {
        let tracker = ProgressTracker::new();
        handle_text_message(r#"{"type":"execution_start","data":{"prompt_id":"p"}}"#, &tracker);
        handle_text_message(r#"{"type":"progress","data":{"value":3,"max":10}}"#, &tracker);
        assert_eq!(tracker.percent("p"), Some(30));

        handle_text_message(
            r#"{"type":"progress","data":{"value":6,"max":10,"prompt_id":"p"}}"#,
            &tracker,
        );
        assert_eq!(tracker.percent("p"), Some(60));
    }

    #[test]
    fn second_sampler_does_not_move_progress_backwards() {
        let tracker = ProgressTracker::new();
        handle_text_message(r#"{"type":"progress","data":{"value":9,"max":10,"prompt_id":"p"}}"#, &tracker);
        handle_text_message(r#"{"type":"progress","data":{"value":1,"max":10,"prompt_id":"p"}}"#, &tracker);
        assert_eq!(tracker.percent("p"), Some(90));
    }

    #[test]
    fn unknown_frames_are_ignored() {
        let tracker = ProgressTracker::new();
        handle_text_message(r#"{"type":"crystools.monitor","data":{}}"#, &tracker);
        handle_text_message("garbage", &tracker);
        assert_eq!(tracker.percent("p"), None);
    }
}
