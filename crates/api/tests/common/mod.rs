#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use kiln_api::config::ServerConfig;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;
use kiln_api::ws::WsManager;
use kiln_comfyui::{EngineHandle, EngineStatus, GatewayError, RenderGateway};
use kiln_core::params::GenerationParams;
use kiln_pipeline::{GenerationService, PipelineConfig};
use tower::ServiceExt;

/// Render engine that accepts everything and never finishes, so jobs stay
/// observable in their queued or polling states.
pub struct IdleGateway;

#[async_trait]
impl RenderGateway for IdleGateway {
    async fn submit(&self, _params: &GenerationParams) -> Result<EngineHandle, GatewayError> {
        Ok(EngineHandle::new("prompt-idle"))
    }

    async fn poll(&self, _handle: &EngineHandle) -> Result<EngineStatus, GatewayError> {
        Ok(EngineStatus::Pending)
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        json_logs: false,
    }
}

pub fn test_service() -> Arc<GenerationService> {
    let config = PipelineConfig {
        worker_count: 1,
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    GenerationService::builder(config, Arc::new(IdleGateway)).start()
}

/// Build the full application router with the production middleware stack.
pub fn build_test_app(service: Arc<GenerationService>) -> Router {
    let config = test_config();
    let state = AppState {
        service,
        pool: None,
        config: Arc::new(config.clone()),
        ws_manager: Arc::new(WsManager::new()),
    };
    build_app_router(state, &config)
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
