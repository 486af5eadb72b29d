//! Callback notify sink.
//!
//! External executors deliver each task's typed result here. Redelivery is
//! safe: a duplicate or late payload reports `duplicate` / `stale` instead of
//! changing the node.

use axum::Json;
use axum::extract::{Path, State};
use tracing::info;

use nodeflow_types::callback::{ResolveOutcome, ResultPayload};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// POST /api/v1/callbacks/{callback_id} - Deliver a result for a callback id.
pub async fn notify_callback(
    State(state): State<AppState>,
    Path(callback_id): Path<String>,
    Json(payload): Json<ResultPayload>,
) -> Result<Json<ApiResponse<ResolveOutcome>>, AppError> {
    let timer = RequestTimer::start();

    let outcome = state.engine.protocol().notify(&callback_id, payload).await?;
    info!(callback_id = %callback_id, outcome = ?outcome, "callback delivered");

    let resp = timer
        .success(outcome)
        .with_link("self", &format!("/api/v1/callbacks/{callback_id}"));
    Ok(Json(resp))
}
