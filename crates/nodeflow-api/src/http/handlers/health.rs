//! Liveness and database reachability.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::http::error::AppError;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

/// GET /api/v1/health
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let timer = RequestTimer::start();

    sqlx::query("SELECT 1")
        .execute(&state.db_pool.reader)
        .await
        .map_err(|e| AppError::Internal(format!("database unreachable: {e}")))?;

    Ok(Json(timer.success(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))))
}
