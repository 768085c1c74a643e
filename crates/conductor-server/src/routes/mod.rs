//! HTTP route handlers.

pub mod admin;
pub mod jobs;
pub mod runs;
pub mod usage;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use conductor_core::Error;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(admin::routes())
        .merge(runs::routes())
        .merge(jobs::routes())
        .merge(usage::routes())
}

pub type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Map an error to a status code and `{"error": ...}` body.
pub fn error_response(err: &Error) -> ApiResponse {
    let status = match err {
        Error::Precondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Paused => StatusCode::SERVICE_UNAVAILABLE,
        Error::Json(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}
