//! HTTP/REST API layer for nodeflow.
//!
//! Axum-based REST API at `/api/v1/` with an envelope response format. Hosts
//! the callback notify sink and read-only execution inspection.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
