//! The boundary between the orchestrator and a render engine.

use std::error::Error as _;
use std::fmt;

use async_trait::async_trait;
use kiln_core::job::Artifact;
use kiln_core::params::GenerationParams;

/// Opaque identifier the render engine assigned to one accepted attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineHandle(String);

impl EngineHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a submitted attempt, as reported by one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    /// Accepted but not yet running, or not (yet) visible to the engine.
    Pending,
    /// Running, with completion percentage 0-100.
    Running(u8),
    /// Finished; the produced artifacts.
    Done(Vec<Artifact>),
    /// The engine gave up on the attempt.
    Failed(String),
}

/// Errors from talking to the render engine.
///
/// The `Display` text is what gets classified, so transport errors include
/// their whole source chain.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {}", describe_request_error(.0))]
    Request(#[from] reqwest::Error),

    /// The engine returned a non-2xx status code.
    #[error("Render engine API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The engine answered with something we could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The parameter document could not be turned into a workflow.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// The engine has no such primitive.
    #[error("Operation not supported by the render engine: {0}")]
    Unsupported(&'static str),
}

/// Flatten a reqwest error and its sources into one line.
fn describe_request_error(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    if err.is_timeout() && !text.contains("timed out") {
        text.push_str(": operation timed out");
    }
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// Client abstraction over one render engine.
///
/// Implementations perform exactly one remote call per method and never
/// retry; every recovery decision belongs to the orchestrator.
#[async_trait]
pub trait RenderGateway: Send + Sync {
    /// Submit a parameter document, returning the engine's handle.
    async fn submit(&self, params: &GenerationParams) -> Result<EngineHandle, GatewayError>;

    /// Report the current status of a submitted attempt.
    async fn poll(&self, handle: &EngineHandle) -> Result<EngineStatus, GatewayError>;

    /// Ask the engine to drop an attempt. Engines without a cancel
    /// primitive keep this default.
    async fn cancel(&self, handle: &EngineHandle) -> Result<(), GatewayError> {
        let _ = handle;
        Err(GatewayError::Unsupported("cancel"))
    }

    /// Forget local bookkeeping for an attempt that was abandoned without
    /// a terminal status or a cancel, e.g. after a failed poll.
    fn release(&self, handle: &EngineHandle) {
        let _ = handle;
    }
}
