//! External task executor collaborator and the step handler that delegates
//! to it.
//!
//! The executor only has to hand back a correlation id for each submitted
//! task and later deliver exactly one typed result for it through the notify
//! sink. Duplicate deliveries are tolerated by `CallbackProtocol::resolve`.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nodeflow_types::callback::{DispatchResult, StepSpec};
use nodeflow_types::error::{EngineError, ValidationError};
use nodeflow_types::execution::{Ambiance, ExecutionMode, NodeExecution};

use super::handler::StepHandler;

/// Out-of-process executor (delegate agent, worker pool, ...).
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskExecutor: Send + Sync {
    /// Submit work and return its task id. Never waits for completion.
    fn submit(
        &self,
        scope: &Ambiance,
        spec: &StepSpec,
    ) -> impl Future<Output = Result<String, EngineError>> + Send;

    /// Best-effort cancellation of a submitted task.
    fn cancel(&self, task_id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;
}

/// Configuration shared by every delegated step type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateConfig {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub delegate_selectors: Vec<String>,
}

/// Parameters of a delegated shell command step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStepParameters {
    #[serde(flatten)]
    pub delegate: DelegateConfig,
    pub command: String,
    #[serde(default)]
    pub environment: std::collections::BTreeMap<String, String>,
}

/// Hands a step to a `TaskExecutor` and waits on the returned task id.
pub struct DelegateTaskHandler<E: TaskExecutor> {
    step_type: String,
    executor: E,
}

impl<E: TaskExecutor> DelegateTaskHandler<E> {
    pub fn new(step_type: impl Into<String>, executor: E) -> Self {
        Self {
            step_type: step_type.into(),
            executor,
        }
    }
}

impl<E: TaskExecutor> StepHandler for DelegateTaskHandler<E> {
    fn step_type(&self) -> &str {
        &self.step_type
    }

    fn waiting_mode(&self) -> ExecutionMode {
        ExecutionMode::Task
    }

    fn validate(&self, spec: &StepSpec) -> Result<(), ValidationError> {
        let params: CommandStepParameters = serde_json::from_value(spec.parameters.clone())
            .map_err(|e| ValidationError::InvalidStepSpec(format!("{}: {e}", spec.identifier)))?;
        if params.command.trim().is_empty() {
            return Err(ValidationError::InvalidStepSpec(format!(
                "{}: command must not be empty",
                spec.identifier
            )));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        node: &NodeExecution,
        spec: &StepSpec,
    ) -> Result<DispatchResult, EngineError> {
        let task_id = self.executor.submit(&node.ambiance, spec).await?;
        debug!(node_execution_id = %node.id, task_id = %task_id, "task submitted");
        Ok(DispatchResult::Pending {
            callback_ids: vec![task_id],
        })
    }

    async fn abort(&self, node: &NodeExecution) -> Result<(), EngineError> {
        for task_id in node.pending_callback_ids() {
            if let Err(e) = self.executor.cancel(&task_id).await {
                warn!(node_execution_id = %node.id, task_id = %task_id, error = %e, "task cancel failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NullExecutor;

    impl TaskExecutor for NullExecutor {
        async fn submit(&self, _scope: &Ambiance, _spec: &StepSpec) -> Result<String, EngineError> {
            Ok("task-1".into())
        }

        async fn cancel(&self, _task_id: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn parameters_embed_shared_delegate_config() {
        let params: CommandStepParameters = serde_json::from_value(json!({
            "timeout_secs": 60,
            "delegate_selectors": ["linux"],
            "command": "make test"
        }))
        .unwrap();
        assert_eq!(params.delegate.timeout_secs, Some(60));
        assert_eq!(params.delegate.delegate_selectors, vec!["linux".to_string()]);
        assert_eq!(params.command, "make test");
    }

    #[test]
    fn validate_rejects_missing_command() {
        let handler = DelegateTaskHandler::new("Command", NullExecutor);
        let err = handler
            .validate(&StepSpec::new("Command", "build", json!({"timeout_secs": 5})))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidStepSpec(_)));

        let err = handler
            .validate(&StepSpec::new("Command", "build", json!({"command": "  "})))
            .unwrap_err();
        assert!(err.to_string().contains("command must not be empty"));
    }

    #[tokio::test]
    async fn dispatch_returns_task_id() {
        let handler = DelegateTaskHandler::new("Command", NullExecutor);
        let spec = StepSpec::new("Command", "build", json!({"command": "make"}));
        let result = handler.dispatch(&NodeExecution::default(), &spec).await.unwrap();
        assert_eq!(
            result,
            DispatchResult::Pending {
                callback_ids: vec!["task-1".into()]
            }
        );
    }
}
