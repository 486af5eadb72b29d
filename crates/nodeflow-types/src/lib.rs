//! Shared domain types for nodeflow.
//!
//! Node execution records, statuses, query/update values, callback and sync
//! payloads, orchestration events, configuration and error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod callback;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod query;
pub mod sync;
