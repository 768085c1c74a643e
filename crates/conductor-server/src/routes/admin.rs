//! Health and admission control.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/admin/status", get(status))
        .route("/admin/pause", post(pause))
        .route("/admin/resume", post(resume))
}

/// GET /api/health
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.config.model.model,
        "paused": state.orchestrator.is_paused(),
    }))
}

/// GET /api/admin/status
/// Admission state and free slots per function kind.
async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.orchestrator.status()))
}

/// POST /api/admin/pause
/// Stop admitting runs; in-flight runs finish.
async fn pause(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.orchestrator.pause();
    Json(serde_json::json!(state.orchestrator.status()))
}

/// POST /api/admin/resume
async fn resume(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.orchestrator.resume();
    Json(serde_json::json!(state.orchestrator.status()))
}
