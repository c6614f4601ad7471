//! ComfyUI implementation of [`RenderGateway`].
//!
//! [`ComfyUIGateway`] submits through the REST API and answers polls from
//! `/history` (terminal outcomes) and `/queue` (running vs. pending), with
//! the running percentage taken from the WebSocket listener started by
//! [`ComfyUIGateway::spawn_listener`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::params::GenerationParams;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{status_from_history, ComfyUIApi, QueuePlacement};
use crate::client::ComfyUIClient;
use crate::gateway::{EngineHandle, EngineStatus, GatewayError, RenderGateway};
use crate::processor::run_listener;
use crate::reconnect::ReconnectConfig;
use crate::tracker::ProgressTracker;
use crate::workflow::{params_document, WorkflowTemplate};

/// Default per-request timeout for ComfyUI HTTP calls.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connection settings for one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIConfig {
    pub api_url: String,
    pub ws_url: String,
    /// Workflow template to render parameters into. Without one, the
    /// parameter document itself is submitted as the prompt.
    pub workflow_template: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl ComfyUIConfig {
    /// Load from environment variables.
    ///
    /// | Env var                       | Default                  |
    /// |-------------------------------|--------------------------|
    /// | `COMFYUI_API_URL`             | `http://127.0.0.1:8188`  |
    /// | `COMFYUI_WS_URL`              | `ws://127.0.0.1:8188`    |
    /// | `WORKFLOW_TEMPLATE_PATH`      | (none)                   |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS`| `30`                     |
    pub fn from_env() -> Self {
        let api_url =
            std::env::var("COMFYUI_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8188".into());
        let ws_url =
            std::env::var("COMFYUI_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8188".into());
        let workflow_template = std::env::var("WORKFLOW_TEMPLATE_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let request_timeout_secs = match std::env::var("COMFYUI_REQUEST_TIMEOUT_SECS") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "Invalid COMFYUI_REQUEST_TIMEOUT_SECS, using default");
                DEFAULT_REQUEST_TIMEOUT_SECS
            }),
            Err(_) => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Self {
            api_url,
            ws_url,
            workflow_template,
            request_timeout: Duration::from_secs(request_timeout_secs),
        }
    }
}

pub struct ComfyUIGateway {
    api: ComfyUIApi,
    client: Arc<ComfyUIClient>,
    template: Option<WorkflowTemplate>,
    tracker: Arc<ProgressTracker>,
}

impl ComfyUIGateway {
    /// Build the gateway. Fails if the workflow template cannot be loaded
    /// or the HTTP client cannot be constructed.
    pub fn new(config: &ComfyUIConfig) -> Result<Self, GatewayError> {
        let template = config
            .workflow_template
            .as_deref()
            .map(WorkflowTemplate::from_file)
            .transpose()?;
        if let Some(template) = &template {
            tracing::info!(placeholders = ?template.placeholders(), "Loaded workflow template");
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let client_id = uuid::Uuid::new_v4().to_string();

        Ok(Self {
            api: ComfyUIApi::with_client(http, config.api_url.clone()),
            client: Arc::new(ComfyUIClient::new(config.ws_url.clone(), client_id)),
            template,
            tracker: Arc::new(ProgressTracker::new()),
        })
    }

    /// Start the progress listener on `tasks`; it stops when `cancel` fires.
    pub fn spawn_listener(&self, tasks: &TaskTracker, cancel: CancellationToken) {
        let client = Arc::clone(&self.client);
        let tracker = Arc::clone(&self.tracker);

        tasks.spawn(async move {
            tracing::info!(ws_url = client.ws_url(), "Starting ComfyUI progress listener");
            run_listener(&client, &tracker, &ReconnectConfig::default(), &cancel).await;
            tracing::info!("ComfyUI progress listener exited");
        });
    }

    fn build_workflow(&self, params: &GenerationParams) -> Result<serde_json::Value, GatewayError> {
        match &self.template {
            Some(template) => template.render(params),
            None => Ok(params_document(params)),
        }
    }
}

#[async_trait]
impl RenderGateway for ComfyUIGateway {
    async fn submit(&self, params: &GenerationParams) -> Result<EngineHandle, GatewayError> {
        let workflow = self.build_workflow(params)?;
        let response = self
            .api
            .submit_workflow(&workflow, self.client.client_id())
            .await?;

        if !response.node_errors.is_empty() {
            tracing::warn!(
                prompt_id = %response.prompt_id,
                node_errors = %serde_json::Value::Object(response.node_errors.clone()),
                "ComfyUI accepted prompt with node errors",
            );
        }
        tracing::debug!(prompt_id = %response.prompt_id, number = response.number, "Workflow submitted");

        Ok(EngineHandle::new(response.prompt_id))
    }

    async fn poll(&self, handle: &EngineHandle) -> Result<EngineStatus, GatewayError> {
        let prompt_id = handle.as_str();

        if let Some(entry) = self.api.get_history(prompt_id).await? {
            if let Some(status) = status_from_history(&entry) {
                self.tracker.forget(prompt_id);
                return Ok(status);
            }
            let percent = self.tracker.percent(prompt_id).unwrap_or(0);
            return Ok(EngineStatus::Running(percent));
        }

        let status = match self.api.get_queue().await?.placement(prompt_id) {
            QueuePlacement::Running => {
                EngineStatus::Running(self.tracker.percent(prompt_id).unwrap_or(0))
            }
            QueuePlacement::Pending => EngineStatus::Pending,
            // Not in history and not queued: either just finishing between
            // the two reads or lost. The attempt timeout covers the latter.
            QueuePlacement::Absent => EngineStatus::Pending,
        };
        Ok(status)
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<(), GatewayError> {
        let prompt_id = handle.as_str();
        let placement = self.api.get_queue().await?.placement(prompt_id);

        match placement {
            QueuePlacement::Pending => self.api.cancel_execution(prompt_id).await?,
            QueuePlacement::Running => self.api.interrupt().await?,
            QueuePlacement::Absent => {}
        }
        self.tracker.forget(prompt_id);

        tracing::info!(prompt_id, ?placement, "Cancelled ComfyUI prompt");
        Ok(())
    }

    fn release(&self, handle: &EngineHandle) {
        self.tracker.forget(handle.as_str());
    }
}
