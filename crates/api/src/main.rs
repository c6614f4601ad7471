use std::net::SocketAddr;
use std::sync::Arc;

use kiln_comfyui::{ComfyUIConfig, ComfyUIGateway};
use kiln_pipeline::store::PgJobStore;
use kiln_pipeline::{GenerationService, PipelineConfig};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_api::config::ServerConfig;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;
use kiln_api::ws;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid server configuration");

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kiln_api=debug,kiln_pipeline=debug,tower_http=debug".into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    let pipeline_config = PipelineConfig::from_env().expect("Invalid pipeline configuration");
    let comfyui_config = ComfyUIConfig::from_env();

    // --- Database (optional) ---
    let pool = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = kiln_db::create_pool(&database_url)
                .await
                .expect("Failed to connect to database");
            kiln_db::health_check(&pool)
                .await
                .expect("Database health check failed");
            kiln_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database ready, write-through persistence enabled");
            Some(pool)
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, jobs are kept in memory only");
            None
        }
    };

    // --- Render engine ---
    let gateway =
        Arc::new(ComfyUIGateway::new(&comfyui_config).expect("Failed to build ComfyUI gateway"));
    let engine_tasks = TaskTracker::new();
    let engine_cancel = CancellationToken::new();
    gateway.spawn_listener(&engine_tasks, engine_cancel.clone());
    tracing::info!(api_url = %comfyui_config.api_url, "ComfyUI gateway ready");

    // --- Generation service ---
    let mut builder = GenerationService::builder(pipeline_config, gateway);
    if let Some(pool) = &pool {
        builder = builder.store(Arc::new(PgJobStore::new(pool.clone())));
    }
    let service = builder.start();

    // --- WebSocket manager ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager), heartbeat_cancel.clone());

    // --- App state ---
    let state = AppState {
        service: Arc::clone(&service),
        pool,
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Drain jobs first so open relays still receive their final events.
    service.shutdown().await;

    engine_cancel.cancel();
    engine_tasks.close();
    engine_tasks.wait().await;
    tracing::info!("ComfyUI listener stopped");

    let ws_count = ws_manager.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    ws_manager.shutdown_all().await;

    heartbeat_cancel.cancel();
    let _ = heartbeat_handle.await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
