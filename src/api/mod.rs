mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use errors::{AppError, ErrorResponse};

use crate::app::Orchestrator;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub orchestrator: Orchestrator,
}

/// Build the router. Split from `serve` so tests can drive it directly.
pub fn router(orchestrator: Orchestrator, max_body: usize) -> Router {
    let state = Arc::new(AppState { orchestrator });

    Router::new()
        .route("/runs", post(handlers::create_run).get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::run_status))
        .route("/runs/{id}/context", get(handlers::run_context))
        .route("/runs/{id}/answer", post(handlers::submit_answer))
        .route("/runs/{id}/artifacts", get(handlers::list_artifacts))
        .route("/runs/{id}/artifacts/{*path}", get(handlers::get_artifact))
        .route("/flows", get(handlers::list_flows))
        .route(
            "/flow-runs",
            post(handlers::create_flow_run).get(handlers::list_flow_runs),
        )
        .route("/flow-runs/{id}", get(handlers::get_flow_run))
        .route("/flow-runs/{id}/cancel", post(handlers::cancel_flow_run))
        .route("/rate-limit", get(handlers::rate_limit_status))
        .route("/rate-limit/release-all", post(handlers::force_release_all))
        .route("/storage/stats", get(handlers::storage_stats))
        .route("/storage/cleanup", post(handlers::cleanup))
        .route("/plugins", get(handlers::list_plugins))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(orchestrator: Orchestrator, host: &str, port: u16, max_body: usize) -> Result<()> {
    let app = router(orchestrator, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("qaflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
