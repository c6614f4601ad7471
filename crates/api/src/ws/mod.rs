//! WebSocket relays for job progress and system status.
//!
//! Provides connection tracking, heartbeat pings, and the HTTP upgrade
//! handlers used by Axum routes.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::{encode_event, job_events_ws, system_status_ws, SYSTEM_TOPIC};
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
