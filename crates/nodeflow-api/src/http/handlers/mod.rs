//! HTTP request handlers for the REST API.

pub mod callback;
pub mod execution;
pub mod health;
