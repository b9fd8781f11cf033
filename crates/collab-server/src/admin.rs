//! HTTP admin surface.

use crate::handlers::AppState;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use collab_core::{ManagerState, ProjectDirectory};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::error;

/// Build the admin router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/connections", get(connections_handler))
        .with_state(state)
}

/// Serve the admin router on `listener`.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) {
    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("Admin server failed: {}", e);
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = &state.manager;
    let dispatch = manager.dispatch_stats();
    let status = match manager.state() {
        ManagerState::Running => "ok",
        ManagerState::Created => "starting",
        ManagerState::Terminated => "stopping",
    };

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "clients": manager.projects().client_count(),
        "projects": manager.projects().project_count(),
        "queue_depth": manager.queue_depth(),
        "dispatch": {
            "packets": dispatch.packets,
            "forwarded": dispatch.forwarded,
            "acknowledged": dispatch.acknowledged,
            "filtered": dispatch.filtered,
            "failed": dispatch.failed,
        },
    }))
}

/// Per-client send/receive counters.
async fn stats_handler(State(state): State<Arc<AppState>>) -> String {
    state.manager.dump_stats()
}

/// Fixed-width connection listing.
async fn connections_handler(State(state): State<Arc<AppState>>) -> String {
    state.manager.list_connections()
}
