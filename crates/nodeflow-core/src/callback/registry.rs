//! Step-type registry.
//!
//! Maps step-type tags to boxed handlers. Populated once at startup; lookups
//! of an unregistered type fail with `ValidationError::UnknownStepType`.

use std::collections::HashMap;

use nodeflow_types::error::ValidationError;

use super::handler::{BoxStepHandler, StepHandler};

#[derive(Debug, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, BoxStepHandler>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own step type, replacing any previous one.
    pub fn register<T: StepHandler + 'static>(&mut self, handler: T) {
        let boxed = BoxStepHandler::new(handler);
        self.handlers.insert(boxed.step_type().to_string(), boxed);
    }

    pub fn get(&self, step_type: &str) -> Result<&BoxStepHandler, ValidationError> {
        self.handlers
            .get(step_type)
            .ok_or_else(|| ValidationError::UnknownStepType(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub fn step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
