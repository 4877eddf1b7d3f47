//! HTTP boundary: `POST /chat`, `POST /stream` (SSE) and `GET /health`.

pub mod routes;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::agent::orchestrator::Orchestrator;

/// Build the gateway router around a shared orchestrator.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/chat", post(routes::chat))
        .route("/stream", post(routes::stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

/// Serve the gateway until the listener fails.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: std::net::SocketAddr) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, router(orchestrator))
        .await
        .map_err(|e| format!("gateway server error: {e}"))
}
