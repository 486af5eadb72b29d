//! Orchestration event bus.
//!
//! Provides an `OrchestrationEventBus` that distributes `OrchestrationEvent`
//! messages to all subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::OrchestrationEventBus;
