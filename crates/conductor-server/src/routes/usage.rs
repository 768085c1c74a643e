//! Usage ledger and balance routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use super::{error_response, ApiResponse};
use crate::state::AppState;
use conductor_billing::{current_month, evaluate_auto_reload};
use conductor_core::Error;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workspaces/{id}/usage", get(get_usage))
        .route("/subscriptions/{owner_id}", get(get_subscription))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// GET /api/workspaces/{id}/usage
/// Totals plus the most recent entries.
async fn get_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> ApiResponse {
    let summary = match state.store.usage_summary(&id) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match state.store.list_usage(&id, query.limit.min(1_000)) {
        Ok(entries) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "workspaceId": id,
                "summary": summary,
                "entries": entries,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /api/subscriptions/{owner_id}
/// Balance and reload settings.
async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> ApiResponse {
    match state.store.get_subscription(&owner_id) {
        Ok(Some(sub)) => {
            let month = current_month();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "subscription": sub,
                    "reloadedThisMonth": sub.reloaded_in_month(&month),
                    "reloadEligible": evaluate_auto_reload(&sub, &month).is_some(),
                })),
            )
        }
        Ok(None) => error_response(&Error::NotFound(format!("subscription for {}", owner_id))),
        Err(e) => error_response(&e),
    }
}
