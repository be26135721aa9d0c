//! HTTP and WebSocket front end for the draw engine.
//!
//! | Path | Description |
//! |------|-------------|
//! | `/health` | Liveness check |
//! | `/api/status` | Current round, countdowns and previous result |
//! | `/api/config` | Change the schedule (admin) |
//! | `/api/force-preview`, `/api/force-final` | Out-of-schedule events (admin) |
//! | `/ws` | Live event stream |
//! | anything else | Static files from the public directory |

mod api;
mod ws;

use crate::config::{ServerConfig, DEFAULT_ADMIN_TOKEN};
use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use livedraw_core::{DrawEngine, EngineHandle};
use std::path::Path;
use std::sync::Arc;
use tower_http::services::ServeDir;

/// Shared state passed to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub admin_token: Arc<str>,
}

pub fn router(state: AppState, public_dir: &Path) -> Router {
    let admin = Router::new()
        .route("/api/config", post(api::update_config))
        .route("/api/force-preview", post(api::force_preview))
        .route("/api/force-final", post(api::force_final))
        .route_layer(middleware::from_fn_with_state(state.clone(), api::require_admin));

    Router::new()
        .route("/health", get(api::health))
        .route("/api/status", get(api::status))
        .route("/ws", get(ws::handle_websocket))
        .merge(admin)
        .fallback_service(ServeDir::new(public_dir))
        .with_state(state)
}

/// Start the engine and serve until Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<()> {
    config.validate()?;

    if config.admin_token == DEFAULT_ADMIN_TOKEN {
        tracing::warn!("Using the default admin token; set ADMIN_TOKEN to change it");
    }

    let engine = DrawEngine::spawn(config.engine_config())?;
    let state = AppState {
        engine: engine.clone(),
        admin_token: config.admin_token.as_str().into(),
    };
    let app = router(state, &config.public_dir);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("livedraw listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server terminated unexpectedly")?;

    engine.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
