//! Render engine gateway and its ComfyUI implementation.
//!
//! [`gateway::RenderGateway`] is the narrow boundary the orchestrator
//! depends on: submit, poll, and (optionally) cancel, with no retry logic
//! of its own. [`manager::ComfyUIGateway`] implements it against a ComfyUI
//! server using the REST API for submission and status, plus a WebSocket
//! listener that tracks per-prompt progress.

pub mod api;
pub mod client;
pub mod gateway;
pub mod manager;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod tracker;
pub mod workflow;

pub use gateway::{EngineHandle, EngineStatus, GatewayError, RenderGateway};
pub use manager::{ComfyUIConfig, ComfyUIGateway};
