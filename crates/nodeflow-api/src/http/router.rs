//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Notify sink
        .route(
            "/callbacks/{callback_id}",
            post(handlers::callback::notify_callback),
        )
        // Inspection
        .route(
            "/executions/{plan_id}/tree",
            get(handlers::execution::get_tree),
        )
        .route(
            "/executions/{plan_id}/stages",
            get(handlers::execution::get_stages),
        )
        .route(
            "/executions/{plan_id}/abort",
            post(handlers::execution::abort_execution),
        )
        .route("/health", get(handlers::health::health_check));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
