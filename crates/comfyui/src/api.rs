//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, queue inspection, cancellation, interruption
//! and history retrieval using [`reqwest`]. Responses are decoded into
//! typed views that keep only the fields the gateway reads.

use std::collections::HashMap;

use kiln_core::job::Artifact;
use serde::Deserialize;

use crate::gateway::{EngineStatus, GatewayError};

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors. ComfyUI may accept the prompt and still
    /// report these.
    #[serde(default)]
    pub node_errors: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One entry of `GET /history/{prompt_id}`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: HashMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Files a single graph node wrote.
#[derive(Debug, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
    #[serde(default)]
    pub videos: Vec<OutputFile>,
}

#[derive(Debug, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output` for saved files, `temp` for previews.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl OutputFile {
    fn is_preview(&self) -> bool {
        self.kind.as_deref() == Some("temp")
    }

    fn relative_path(&self) -> String {
        if self.subfolder.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.subfolder, self.filename)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[message_type, data]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

impl HistoryStatus {
    /// Human-readable failure text from the recorded `execution_error`.
    fn error_message(&self) -> String {
        self.messages
            .iter()
            .find(|(kind, _)| kind == "execution_error")
            .map(|(_, data)| {
                let message = data
                    .get("exception_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("execution error")
                    .trim();
                match data.get("exception_type").and_then(|v| v.as_str()) {
                    Some(kind) if !kind.is_empty() => format!("{kind}: {message}"),
                    _ => message.to_string(),
                }
            })
            .unwrap_or_else(|| "execution error".to_string())
    }
}

/// Collect saved output files across all nodes, ordered by node id.
pub fn collect_artifacts(entry: &HistoryEntry) -> Vec<Artifact> {
    let mut nodes: Vec<_> = entry.outputs.iter().collect();
    nodes.sort_by(|a, b| a.0.cmp(b.0));

    nodes
        .into_iter()
        .flat_map(|(node_id, output)| {
            output
                .images
                .iter()
                .chain(&output.gifs)
                .chain(&output.videos)
                .filter(|file| !file.is_preview())
                .map(move |file| Artifact {
                    path: file.relative_path(),
                    node_id: Some(node_id.clone()),
                })
        })
        .collect()
}

/// Map a history entry to a terminal status, or `None` while it is still
/// executing.
pub fn status_from_history(entry: &HistoryEntry) -> Option<EngineStatus> {
    match &entry.status {
        Some(status) if status.status_str == "error" => {
            Some(EngineStatus::Failed(status.error_message()))
        }
        Some(status) if status.completed || status.status_str == "success" => {
            Some(EngineStatus::Done(collect_artifacts(entry)))
        }
        Some(_) => None,
        // Servers predating the status block only write history on success.
        None => Some(EngineStatus::Done(collect_artifacts(entry))),
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// `GET /queue`. Each item is `[number, prompt_id, prompt, extra, outputs]`.
#[derive(Debug, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub queue_pending: Vec<Vec<serde_json::Value>>,
}

/// Where a prompt sits in the engine's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePlacement {
    Running,
    Pending,
    Absent,
}

impl QueueSnapshot {
    pub fn placement(&self, prompt_id: &str) -> QueuePlacement {
        let contains = |items: &[Vec<serde_json::Value>]| {
            items
                .iter()
                .any(|item| item.get(1).and_then(|v| v.as_str()) == Some(prompt_id))
        };
        if contains(&self.queue_running) {
            QueuePlacement::Running
        } else if contains(&self.queue_pending) {
            QueuePlacement::Pending
        } else {
            QueuePlacement::Absent
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl ComfyUIApi {
    /// Create an API client reusing an existing [`reqwest::Client`].
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Submit a workflow for execution (`POST /prompt`).
    ///
    /// `client_id` routes the WebSocket progress messages for this prompt
    /// to the listener connected under the same id.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, GatewayError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the history entry of one prompt, `None` if the engine has
    /// not recorded it (yet).
    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, GatewayError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let mut history: HashMap<String, HistoryEntry> = Self::parse_response(response).await?;
        Ok(history.remove(prompt_id))
    }

    /// Retrieve the running and pending queues.
    pub async fn get_queue(&self) -> Result<QueueSnapshot, GatewayError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Delete a pending prompt from the queue. A no-op for prompts that are
    /// already running or finished.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), GatewayError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Protocol(format!("Malformed response body: {e}")))
    }

    async fn check_status(response: reqwest::Response) -> Result<(), GatewayError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}
