//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod callback;
pub mod node_execution;
pub mod pool;
mod query;
