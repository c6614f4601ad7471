use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// WebSocket relay routes (root level, NOT under `/api/v1`).
///
/// ```text
/// GET    /ws/jobs/{id}    -> job_events_ws
/// GET    /ws/system       -> system_status_ws
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/jobs/{id}", get(ws::job_events_ws))
        .route("/ws/system", get(ws::system_status_ws))
}
