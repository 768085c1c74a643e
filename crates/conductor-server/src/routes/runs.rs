//! Run triggers. Preconditions are checked before anything is written;
//! accepted runs continue in the background and are followed via the job.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::info;

use super::{error_response, ApiResponse};
use crate::state::AppState;
use conductor_core::Result;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/subtasks/{id}/execute", post(execute_subtask))
        .route("/issues/{id}/execute-sequential", post(execute_sequential))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody {
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SequentialBody {
    subtask_ids: Option<Vec<String>>,
    run_id: Option<String>,
}

/// An empty body means all defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/// POST /api/subtasks/{id}/execute
async fn execute_subtask(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResponse {
    let request = match parse_body::<ExecuteBody>(&body)
        .and_then(|b| state.orchestrator.prepare_subtask(&id, b.run_id))
    {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };

    info!("Accepted subtask {} as run {}", id, request.run_id);
    let run_id = request.run_id.clone();
    state.orchestrator.spawn_subtask(request);

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "runId": run_id, "subtaskId": id })),
    )
}

/// POST /api/issues/{id}/execute-sequential
async fn execute_sequential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResponse {
    let request = match parse_body::<SequentialBody>(&body).and_then(|b| {
        state
            .orchestrator
            .prepare_sequential(&id, b.subtask_ids, b.run_id)
    }) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };

    info!(
        "Accepted chain of {} subtasks under {} as run {}",
        request.subtask_ids.len(),
        id,
        request.run_id
    );
    let response = serde_json::json!({
        "runId": request.run_id,
        "parentId": id,
        "subtaskIds": request.subtask_ids,
    });
    state.orchestrator.spawn_sequential(request);

    (StatusCode::ACCEPTED, Json(response))
}
