//! Repository implementations that live in core.

pub mod memory;

pub use memory::{InMemoryCallbackRepository, InMemoryNodeExecutionRepository};
