use std::sync::Arc;

use kiln_pipeline::GenerationService;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    /// Job orchestration: enqueue, status, cancel, subscriptions.
    pub service: Arc<GenerationService>,
    /// Present when write-through persistence is enabled.
    pub pool: Option<kiln_db::DbPool>,
    pub config: Arc<ServerConfig>,
    /// Open WebSocket relays.
    pub ws_manager: Arc<WsManager>,
}
