//! Execution inspection and plan-wide abort.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use uuid::Uuid;

use nodeflow_core::AbortSummary;
use nodeflow_types::execution::RetryableStageInfo;

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;
use crate::view::{TreeRow, tree_rows};

/// Query parameters for aborting a run.
#[derive(Debug, Deserialize)]
pub struct AbortQuery {
    /// Recorded on every interrupt history entry (default "api").
    #[serde(default = "default_issued_by")]
    pub issued_by: String,
}

fn default_issued_by() -> String {
    "api".to_string()
}

/// GET /api/v1/executions/{plan_id}/tree - Every record of the run, old
/// retries included, in pre-order.
pub async fn get_tree(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<TreeRow>>>, AppError> {
    let timer = RequestTimer::start();

    let adjacency = state.engine.tree().execution_tree(plan_id).await?;
    let resp = timer
        .success(tree_rows(&adjacency))
        .with_link("self", &format!("/api/v1/executions/{plan_id}/tree"))
        .with_link("stages", &format!("/api/v1/executions/{plan_id}/stages"));
    Ok(Json(resp))
}

/// GET /api/v1/executions/{plan_id}/stages - Stages in pipeline order.
pub async fn get_stages(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<RetryableStageInfo>>>, AppError> {
    let timer = RequestTimer::start();

    let stages = state.engine.tree().stage_summary(plan_id).await?;
    let resp = timer
        .success(stages)
        .with_link("self", &format!("/api/v1/executions/{plan_id}/stages"));
    Ok(Json(resp))
}

/// POST /api/v1/executions/{plan_id}/abort - Discontinue and abort every
/// active record of the run.
pub async fn abort_execution(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Query(query): Query<AbortQuery>,
) -> Result<Json<ApiResponse<AbortSummary>>, AppError> {
    let timer = RequestTimer::start();

    let issued_by = query.issued_by.trim();
    if issued_by.is_empty() {
        return Err(AppError::Validation("issued_by must not be empty".to_string()));
    }

    let summary = state.engine.abort_plan(plan_id, issued_by).await?;
    let resp = timer
        .success(summary)
        .with_link("tree", &format!("/api/v1/executions/{plan_id}/tree"));
    Ok(Json(resp))
}
