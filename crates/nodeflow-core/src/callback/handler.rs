//! Step handler capability trait and its type-erased wrapper.
//!
//! Follows the same blanket-impl pattern as the repository ports:
//! 1. `StepHandler` uses RPITIT async methods
//! 2. `StepHandlerDyn` is an object-safe mirror with boxed futures,
//!    blanket-implemented for every `StepHandler`
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` for the registry

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use nodeflow_types::callback::{DispatchResult, ResultPayload, StepSpec};
use nodeflow_types::error::{EngineError, ValidationError};
use nodeflow_types::execution::{ExecutionMode, FailureInfo, FailureType, NodeExecution, Status};

/// Terminal status plus payload fields a resolved step writes back.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResolution {
    pub status: Status,
    pub outcome: Option<Value>,
    pub failure: Option<FailureInfo>,
}

/// Fold every callback result of a node into one resolution.
///
/// Any failure fails the node, with all failure reasons joined. The node is
/// SKIPPED only when every result is a skip. Otherwise it succeeds; a single
/// outcome is kept as-is, several are keyed by callback id.
pub fn aggregate(results: &[(String, ResultPayload)]) -> StepResolution {
    let failures: Vec<(&str, bool)> = results
        .iter()
        .filter_map(|(_, r)| match r {
            ResultPayload::Failure {
                reason,
                irrecoverable,
            } => Some((reason.as_str(), *irrecoverable)),
            _ => None,
        })
        .collect();

    if !failures.is_empty() {
        let message = failures
            .iter()
            .map(|(reason, _)| *reason)
            .collect::<Vec<_>>()
            .join("; ");
        let failure_type = if failures.iter().any(|(_, fatal)| *fatal) {
            FailureType::Executor
        } else {
            FailureType::Application
        };
        return StepResolution {
            status: Status::Failed,
            outcome: None,
            failure: Some(FailureInfo::new(message, failure_type)),
        };
    }

    if !results.is_empty()
        && results
            .iter()
            .all(|(_, r)| matches!(r, ResultPayload::Skipped { .. }))
    {
        return StepResolution {
            status: Status::Skipped,
            outcome: None,
            failure: None,
        };
    }

    let outcomes: Vec<(&String, &Value)> = results
        .iter()
        .filter_map(|(id, r)| match r {
            ResultPayload::Success { outcome } => Some((id, outcome)),
            _ => None,
        })
        .collect();
    let outcome = match outcomes.as_slice() {
        [] => None,
        [(_, single)] => Some((*single).clone()),
        many => Some(Value::Object(
            many.iter()
                .map(|(id, v)| ((*id).clone(), (*v).clone()))
                .collect::<Map<String, Value>>(),
        )),
    };
    StepResolution {
        status: Status::Succeeded,
        outcome,
        failure: None,
    }
}

/// Capability interface every step type implements.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepHandler: Send + Sync {
    /// Step-type tag this handler is registered under.
    fn step_type(&self) -> &str;

    /// Mode a pending dispatch puts the node in.
    fn waiting_mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    /// Reject a malformed spec before anything is dispatched.
    fn validate(&self, spec: &StepSpec) -> Result<(), ValidationError>;

    /// Start the work. Must not block on external completion.
    fn dispatch(
        &self,
        node: &NodeExecution,
        spec: &StepSpec,
    ) -> impl Future<Output = Result<DispatchResult, EngineError>> + Send;

    /// Turn the node's delivered results into a terminal resolution.
    fn resolve(
        &self,
        _node: &NodeExecution,
        results: &[(String, ResultPayload)],
    ) -> impl Future<Output = Result<StepResolution, EngineError>> + Send {
        let resolution = aggregate(results);
        async move { Ok(resolution) }
    }

    /// Called once the node's waits are persisted and it is waiting on
    /// `callback_ids`. Background work that may complete quickly starts here,
    /// so its completion always finds the waits.
    fn on_waiting(&self, _node: &NodeExecution, _callback_ids: &[String]) {}

    /// Stop outstanding external work for the node.
    fn abort(&self, node: &NodeExecution) -> impl Future<Output = Result<(), EngineError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn step_type(&self) -> &str;

    fn waiting_mode(&self) -> ExecutionMode;

    fn validate(&self, spec: &StepSpec) -> Result<(), ValidationError>;

    fn dispatch_boxed<'a>(
        &'a self,
        node: &'a NodeExecution,
        spec: &'a StepSpec,
    ) -> BoxFuture<'a, Result<DispatchResult, EngineError>>;

    fn resolve_boxed<'a>(
        &'a self,
        node: &'a NodeExecution,
        results: &'a [(String, ResultPayload)],
    ) -> BoxFuture<'a, Result<StepResolution, EngineError>>;

    fn on_waiting(&self, node: &NodeExecution, callback_ids: &[String]);

    fn abort_boxed<'a>(&'a self, node: &'a NodeExecution) -> BoxFuture<'a, Result<(), EngineError>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn step_type(&self) -> &str {
        StepHandler::step_type(self)
    }

    fn waiting_mode(&self) -> ExecutionMode {
        StepHandler::waiting_mode(self)
    }

    fn validate(&self, spec: &StepSpec) -> Result<(), ValidationError> {
        StepHandler::validate(self, spec)
    }

    fn dispatch_boxed<'a>(
        &'a self,
        node: &'a NodeExecution,
        spec: &'a StepSpec,
    ) -> BoxFuture<'a, Result<DispatchResult, EngineError>> {
        Box::pin(self.dispatch(node, spec))
    }

    fn resolve_boxed<'a>(
        &'a self,
        node: &'a NodeExecution,
        results: &'a [(String, ResultPayload)],
    ) -> BoxFuture<'a, Result<StepResolution, EngineError>> {
        Box::pin(self.resolve(node, results))
    }

    fn on_waiting(&self, node: &NodeExecution, callback_ids: &[String]) {
        StepHandler::on_waiting(self, node, callback_ids)
    }

    fn abort_boxed<'a>(&'a self, node: &'a NodeExecution) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.abort(node))
    }
}

/// Type-erased step handler for runtime lookup by step type.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn step_type(&self) -> &str {
        self.inner.step_type()
    }

    pub fn waiting_mode(&self) -> ExecutionMode {
        self.inner.waiting_mode()
    }

    pub fn validate(&self, spec: &StepSpec) -> Result<(), ValidationError> {
        self.inner.validate(spec)
    }

    pub async fn dispatch(
        &self,
        node: &NodeExecution,
        spec: &StepSpec,
    ) -> Result<DispatchResult, EngineError> {
        self.inner.dispatch_boxed(node, spec).await
    }

    pub async fn resolve(
        &self,
        node: &NodeExecution,
        results: &[(String, ResultPayload)],
    ) -> Result<StepResolution, EngineError> {
        self.inner.resolve_boxed(node, results).await
    }

    pub fn on_waiting(&self, node: &NodeExecution, callback_ids: &[String]) {
        self.inner.on_waiting(node, callback_ids)
    }

    pub async fn abort(&self, node: &NodeExecution) -> Result<(), EngineError> {
        self.inner.abort_boxed(node).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler")
            .field("step_type", &self.step_type())
            .finish()
    }
}
