//! Infrastructure layer for nodeflow.
//!
//! Contains implementations of the repository traits defined in
//! `nodeflow-core` (SQLite storage with split reader/writer pools) and the
//! TOML configuration loader.

pub mod config;
pub mod sqlite;
