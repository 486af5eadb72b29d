//! Engine logic and repository trait definitions for nodeflow.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `nodeflow-types` -- never on
//! `nodeflow-infra` or any database/IO crate.

pub mod callback;
pub mod engine;
pub mod event;
pub mod execution;
pub mod polling;
pub mod repository;
pub mod store;

pub use engine::{AbortSummary, Engine, PurgeSummary};
