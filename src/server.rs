use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::api::{self, AppState, SharedState};
use crate::orchestrator::Orchestrator;
use crate::ws;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub port: u16,
    /// Bind on all interfaces and allow any origin.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            dev_mode: false,
        }
    }
}

/// Build the full application router: the REST API plus the `/ws` event
/// stream.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve `orchestrator` until Ctrl+C.
pub async fn start_server(config: ServerConfig, orchestrator: Orchestrator) -> Result<()> {
    let mut app = build_router(AppState::shared(orchestrator));

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "trunkline listening");
    println!("trunkline running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrunklineConfig;
    use crate::execution::ProcessAgent;
    use crate::test_support::memory_db;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_router(dir: &std::path::Path) -> Router {
        let config = TrunklineConfig::with_defaults(dir.to_path_buf());
        let runner = Arc::new(ProcessAgent::new("true", Vec::new()));
        build_router(AppState::shared(Orchestrator::new(memory_db(), &config, runner)))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path());
        let req = Request::builder()
            .uri("/api/projects")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path());
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[test]
    fn test_default_port() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3141);
        assert!(!config.dev_mode);
    }
}
