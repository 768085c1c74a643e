//! Job tracker and subtask status routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use super::{error_response, ApiResponse};
use crate::state::AppState;
use conductor_core::Error;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs/{run_id}", get(get_job))
        .route("/workspaces/{id}/jobs", get(list_jobs))
        .route("/issues/{id}/ai-status", get(get_ai_status))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// GET /api/jobs/{run_id}
async fn get_job(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> ApiResponse {
    match state.store.get_job_by_run_id(&run_id) {
        Ok(Some(job)) => (StatusCode::OK, Json(serde_json::json!(job))),
        Ok(None) => error_response(&Error::NotFound(format!("job for run {}", run_id))),
        Err(e) => error_response(&e),
    }
}

/// GET /api/workspaces/{id}/jobs?limit=N
/// Newest first.
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResponse {
    match state.store.list_jobs(&id, query.limit.min(500)) {
        Ok(jobs) => (StatusCode::OK, Json(serde_json::json!({ "jobs": jobs }))),
        Err(e) => error_response(&e),
    }
}

/// GET /api/issues/{id}/ai-status
/// Execution state of one subtask plus the result attachments on the issue.
async fn get_ai_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    let issue = match state.store.get_issue(&id) {
        Ok(Some(issue)) => issue,
        Ok(None) => return error_response(&Error::NotFound(format!("issue {}", id))),
        Err(e) => return error_response(&e),
    };
    let attachments = match state.store.list_attachments(&id) {
        Ok(a) => a,
        Err(e) => return error_response(&e),
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "issueId": issue.id,
            "identifier": issue.identifier,
            "aiExecutionStatus": issue.ai_execution_status,
            "aiExecutionSummary": issue.ai_execution_summary,
            "aiExecutionResult": issue.ai_execution_result,
            "attachments": attachments,
        })),
    )
}
