//! Async callback protocol.
//!
//! `dispatch` starts a step and never blocks on external work: a pending
//! dispatch persists one `CallbackWait` per callback id and returns. The
//! external world later calls `notify`, which resolves the wait at most once
//! and, once every wait of the node holds a terminal payload, moves the node
//! into its terminal status through the state machine. Repeated deliveries
//! are harmless: a terminal node has no valid successor, and a node left
//! waiting by an earlier failed attempt is resolved by the redelivery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nodeflow_types::callback::{
    CallbackWait, DispatchResult, ResolveOutcome, ResultPayload, StepSpec,
};
use nodeflow_types::error::EngineError;
use nodeflow_types::execution::{
    ExecutableResponse, ExecutionMode, FailureInfo, FailureType, InterruptHistory, InterruptType,
    NodeExecution, Status,
};
use nodeflow_types::query::{FieldUpdate, NodeField, NodeUpdate, Projection};

use super::handler::{StepResolution, aggregate};
use super::registry::StepRegistry;
use crate::execution::state_machine::StatusStateMachine;
use crate::repository::callback::CallbackRepository;
use crate::repository::node_execution::NodeExecutionRepository;

/// What `dispatch` did with a step.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The step finished inline and the node moved to `status`.
    Completed { status: Status },
    /// The node is waiting on these callback ids.
    Waiting { callback_ids: Vec<String> },
    /// The node was not in a startable status.
    Stale,
}

pub struct CallbackProtocol<R: NodeExecutionRepository, C: CallbackRepository> {
    state_machine: Arc<StatusStateMachine<R>>,
    callbacks: C,
    registry: Arc<StepRegistry>,
}

impl<R: NodeExecutionRepository, C: CallbackRepository> CallbackProtocol<R, C> {
    pub fn new(
        state_machine: Arc<StatusStateMachine<R>>,
        callbacks: C,
        registry: Arc<StepRegistry>,
    ) -> Self {
        Self {
            state_machine,
            callbacks,
            registry,
        }
    }

    pub fn state_machine(&self) -> &Arc<StatusStateMachine<R>> {
        &self.state_machine
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Validate and start `spec` on node `node_id`.
    ///
    /// The spec is validated before the node is touched. A handler error is
    /// an irrecoverable executor fault: the node is failed with the message
    /// attached and the call still returns `Ok`.
    pub async fn dispatch(&self, node_id: Uuid, spec: &StepSpec) -> Result<DispatchOutcome, EngineError> {
        let handler = self.registry.get(&spec.step_type)?;
        handler.validate(spec)?;

        let start = NodeUpdate::new()
            .set(FieldUpdate::StartTs(Utc::now()))
            .set(FieldUpdate::ResolvedParameters(spec.parameters.clone()));
        let Some(_) = self
            .state_machine
            .transition(node_id, Status::Running, start, &[])
            .await?
        else {
            return Ok(DispatchOutcome::Stale);
        };
        let node = self
            .state_machine
            .store()
            .get_required(node_id, &Projection::callback())
            .await?;

        match handler.dispatch(&node, spec).await {
            Ok(DispatchResult::Sync(payload)) => {
                let resolution = if payload.is_terminal() {
                    let results = vec![(format!("inline-{node_id}"), payload)];
                    match handler.resolve(&node, &results).await {
                        Ok(resolution) => resolution,
                        Err(e) => {
                            warn!(node_execution_id = %node_id, error = %e, "inline resolution failed");
                            StepResolution {
                                status: Status::Failed,
                                outcome: None,
                                failure: Some(FailureInfo::new(e.to_string(), FailureType::Executor)),
                            }
                        }
                    }
                } else {
                    StepResolution {
                        status: Status::Failed,
                        outcome: None,
                        failure: Some(FailureInfo::new(
                            "inline dispatch returned a pending result",
                            FailureType::Executor,
                        )),
                    }
                };
                let status = resolution.status;
                self.finish(node_id, resolution, Some(ExecutionMode::Sync)).await?;
                Ok(DispatchOutcome::Completed { status })
            }
            Ok(DispatchResult::Pending { callback_ids }) => {
                if !self
                    .await_callbacks(&node, handler.waiting_mode(), &callback_ids)
                    .await?
                {
                    return Ok(DispatchOutcome::Stale);
                }
                handler.on_waiting(&node, &callback_ids);
                Ok(DispatchOutcome::Waiting { callback_ids })
            }
            Err(e) => {
                warn!(node_execution_id = %node_id, error = %e, "step dispatch failed");
                let resolution = StepResolution {
                    status: Status::Failed,
                    outcome: None,
                    failure: Some(FailureInfo::new(e.to_string(), FailureType::Executor)),
                };
                self.finish(node_id, resolution, None).await?;
                Ok(DispatchOutcome::Completed {
                    status: Status::Failed,
                })
            }
        }
    }

    async fn await_callbacks(
        &self,
        node: &NodeExecution,
        mode: ExecutionMode,
        callback_ids: &[String],
    ) -> Result<bool, EngineError> {
        // Waits are persisted before the node moves, so a completion that
        // arrives immediately still finds them.
        let waits: Vec<CallbackWait> = callback_ids
            .iter()
            .map(|id| CallbackWait::new(id.clone(), node.id, node.plan_execution_id))
            .collect();
        self.callbacks.register(&waits).await?;

        let (status, response) = match (mode, callback_ids) {
            (ExecutionMode::Task | ExecutionMode::TaskChain, [task_id]) => (
                Status::TaskWaiting,
                ExecutableResponse::Task {
                    task_id: task_id.clone(),
                },
            ),
            _ => (
                Status::AsyncWaiting,
                ExecutableResponse::Async {
                    callback_ids: callback_ids.to_vec(),
                },
            ),
        };
        let update = NodeUpdate::new()
            .set(FieldUpdate::Mode(mode))
            .set(FieldUpdate::AddExecutableResponse(response));
        let waiting = self
            .state_machine
            .transition(node.id, status, update, &[])
            .await?
            .is_some();
        if waiting {
            info!(
                node_execution_id = %node.id,
                callbacks = callback_ids.len(),
                "node waiting on callbacks"
            );
        }
        Ok(waiting)
    }

    /// Notify sink: hand a delivered result for `callback_id` to `resolve`.
    pub async fn notify(
        &self,
        callback_id: &str,
        payload: ResultPayload,
    ) -> Result<ResolveOutcome, EngineError> {
        self.resolve(callback_id, &payload).await
    }

    /// Resolve one callback id. Idempotent under repeated delivery.
    ///
    /// The node transition decides idempotence, not the wait: a redelivery
    /// for an already-resolved wait re-runs the node's resolution as long as
    /// the node is still non-terminal, so a failure after the payload was
    /// stored is recovered by the next delivery.
    pub async fn resolve(
        &self,
        callback_id: &str,
        payload: &ResultPayload,
    ) -> Result<ResolveOutcome, EngineError> {
        let wait = self
            .callbacks
            .get(callback_id)
            .await?
            .ok_or_else(|| EngineError::CallbackNotFound(callback_id.to_string()))?;

        if let ResultPayload::Pending { progress } = payload {
            let recorded = self.callbacks.record_progress(callback_id, progress).await?;
            return Ok(if recorded {
                debug!(callback_id, "callback progress recorded");
                ResolveOutcome::Progress
            } else {
                ResolveOutcome::Duplicate
            });
        }

        let first_delivery = self
            .callbacks
            .resolve_once(callback_id, payload, Utc::now())
            .await?
            .is_some();

        let node = self
            .state_machine
            .store()
            .get_required(wait.node_execution_id, &Projection::callback())
            .await?;
        if !first_delivery && node.status.is_final() {
            debug!(callback_id, "duplicate callback delivery ignored");
            return Ok(ResolveOutcome::Duplicate);
        }

        let waits = self.callbacks.list_for_node(wait.node_execution_id).await?;
        let remaining = waits.iter().filter(|w| !w.is_resolved()).count();
        if remaining > 0 {
            if !first_delivery {
                return Ok(ResolveOutcome::Duplicate);
            }
            debug!(callback_id, remaining, "callback resolved, siblings outstanding");
            return Ok(ResolveOutcome::AwaitingSiblings { remaining });
        }
        if !first_delivery {
            info!(
                callback_id,
                node_execution_id = %node.id,
                "redelivered callback, retrying node resolution"
            );
        }
        let results: Vec<(String, ResultPayload)> = waits
            .into_iter()
            .filter_map(|w| w.result.map(|r| (w.callback_id, r)))
            .collect();

        let resolution = match self.registry.get(&node.step_type) {
            Ok(handler) => handler.resolve(&node, &results).await?,
            Err(_) => aggregate(&results),
        };
        let status = resolution.status;
        Ok(match self.finish(node.id, resolution, None).await? {
            Some(_) => ResolveOutcome::Transitioned { status },
            None if first_delivery => ResolveOutcome::Stale,
            None => ResolveOutcome::Duplicate,
        })
    }

    /// Stop a node: DISCONTINUING, handler abort, then ABORTED.
    pub async fn abort(
        &self,
        node_id: Uuid,
        issued_by: &str,
    ) -> Result<Option<NodeExecution>, EngineError> {
        self.state_machine
            .append_interrupt(node_id, InterruptHistory::new(InterruptType::Abort, issued_by))
            .await?;
        let Some(_) = self
            .state_machine
            .transition(node_id, Status::Discontinuing, NodeUpdate::new(), &[])
            .await?
        else {
            return Ok(None);
        };
        self.abort_handler(node_id).await?;
        self.state_machine
            .transition(node_id, Status::Aborted, NodeUpdate::new(), &[])
            .await
    }

    /// Ask the node's handler to stop outstanding work. Handler failures are
    /// logged; the node is aborted regardless.
    pub async fn abort_handler(&self, node_id: Uuid) -> Result<(), EngineError> {
        let node = self
            .state_machine
            .store()
            .get_required(node_id, &Projection::callback())
            .await?;
        if let Ok(handler) = self.registry.get(&node.step_type) {
            if let Err(e) = handler.abort(&node).await {
                warn!(node_execution_id = %node_id, error = %e, "step abort failed");
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        node_id: Uuid,
        resolution: StepResolution,
        mode: Option<ExecutionMode>,
    ) -> Result<Option<NodeExecution>, EngineError> {
        let mut update = NodeUpdate::new();
        if let Some(mode) = mode {
            update = update.set(FieldUpdate::Mode(mode));
        }
        if let Some(outcome) = resolution.outcome {
            update = update.set(FieldUpdate::Outcome(outcome));
        }
        if let Some(failure) = resolution.failure {
            update = update.set(FieldUpdate::FailureInfo(failure));
        }
        self.state_machine
            .transition_projected(
                node_id,
                resolution.status,
                update,
                &[],
                &Projection::status_update().with(NodeField::FailureInfo),
            )
            .await
    }
}
