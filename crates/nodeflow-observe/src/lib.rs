//! Observability setup for nodeflow: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
