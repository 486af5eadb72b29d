//! Engine assembly.
//!
//! Wires one repository pair, the observer registry and the step registry
//! into the shared components, and hosts the plan-wide operations that span
//! several of them (abort and purge).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use nodeflow_types::config::EngineConfig;
use nodeflow_types::error::EngineError;
use nodeflow_types::event::OrchestrationEvent;
use nodeflow_types::execution::{InterruptHistory, InterruptType, Status};
use nodeflow_types::query::{NodeFilter, Projection};

use crate::callback::protocol::CallbackProtocol;
use crate::callback::registry::StepRegistry;
use crate::callback::sink::{CompletionReceiver, run_completion_pump};
use crate::event::OrchestrationEventBus;
use crate::execution::observer::ObserverRegistry;
use crate::execution::retry_chain::RetryChain;
use crate::execution::state_machine::StatusStateMachine;
use crate::execution::store::NodeExecutionStore;
use crate::execution::tree::TreeNavigator;
use crate::repository::callback::CallbackRepository;
use crate::repository::node_execution::NodeExecutionRepository;

/// Counts reported by `Engine::abort_plan`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortSummary {
    pub discontinued: u64,
    pub handlers_aborted: usize,
    pub aborted: u64,
}

/// Counts reported by `Engine::purge`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeSummary {
    pub nodes: u64,
    pub callbacks: u64,
}

pub struct Engine<R: NodeExecutionRepository, C: CallbackRepository> {
    state_machine: Arc<StatusStateMachine<R>>,
    tree: TreeNavigator<R>,
    retries: RetryChain<R>,
    protocol: Arc<CallbackProtocol<R, C>>,
}

impl<R: NodeExecutionRepository, C: CallbackRepository> Engine<R, C> {
    pub fn new(
        repo: R,
        callbacks: C,
        observers: ObserverRegistry,
        registry: StepRegistry,
        config: &EngineConfig,
    ) -> Self {
        let store = NodeExecutionStore::new(repo, Arc::new(observers))
            .with_max_batch_size(config.store.max_batch_size);
        let events = OrchestrationEventBus::new(config.events.channel_capacity);
        let state_machine = Arc::new(StatusStateMachine::new(Arc::new(store), events));
        Self {
            tree: TreeNavigator::new(state_machine.clone()),
            retries: RetryChain::new(state_machine.clone()),
            protocol: Arc::new(CallbackProtocol::new(
                state_machine.clone(),
                callbacks,
                Arc::new(registry),
            )),
            state_machine,
        }
    }

    pub fn state_machine(&self) -> &Arc<StatusStateMachine<R>> {
        &self.state_machine
    }

    pub fn store(&self) -> &NodeExecutionStore<R> {
        self.state_machine.store()
    }

    pub fn events(&self) -> &OrchestrationEventBus {
        self.state_machine.events()
    }

    pub fn tree(&self) -> &TreeNavigator<R> {
        &self.tree
    }

    pub fn retries(&self) -> &RetryChain<R> {
        &self.retries
    }

    pub fn protocol(&self) -> &Arc<CallbackProtocol<R, C>> {
        &self.protocol
    }

    /// Abort every current node of the run.
    ///
    /// Leaves and queued nodes move to DISCONTINUING in one bulk write, the
    /// handlers of nodes waiting on external work are asked to stop it, and
    /// whatever is still active is then moved to ABORTED in a second bulk
    /// write.
    pub async fn abort_plan(&self, plan_execution_id: Uuid, issued_by: &str) -> Result<AbortSummary, EngineError> {
        let waiting = self
            .store()
            .find(
                &NodeFilter::plan(plan_execution_id)
                    .current()
                    .status_in([Status::AsyncWaiting, Status::TaskWaiting, Status::InterventionWaiting]),
                &Projection::ids_only(),
            )
            .await?;

        let discontinued = self
            .tree
            .mark_leaves_and_queued_discontinuing(plan_execution_id, &Status::active())
            .await?;

        for node in &waiting {
            self.state_machine
                .append_interrupt(node.id, InterruptHistory::new(InterruptType::AbortAll, issued_by))
                .await?;
            self.protocol.abort_handler(node.id).await?;
        }

        let aborted = self
            .state_machine
            .bulk_transition(NodeFilter::plan(plan_execution_id).current(), Status::Aborted)
            .await?;

        let summary = AbortSummary {
            discontinued,
            handlers_aborted: waiting.len(),
            aborted,
        };
        info!(
            plan_execution_id = %plan_execution_id,
            issued_by,
            discontinued,
            aborted,
            "plan execution aborted"
        );
        Ok(summary)
    }

    /// Delete every node record and callback wait of the run.
    pub async fn purge(&self, plan_execution_id: Uuid) -> Result<PurgeSummary, EngineError> {
        let nodes = self.store().purge_plan_execution(plan_execution_id).await?;
        let callbacks = self
            .protocol
            .callbacks()
            .delete_for_plan(plan_execution_id)
            .await?;
        self.events().publish(OrchestrationEvent::PlanExecutionPurged {
            plan_execution_id,
            deleted: nodes,
        });
        Ok(PurgeSummary { nodes, callbacks })
    }
}

impl<R, C> Engine<R, C>
where
    R: NodeExecutionRepository + 'static,
    C: CallbackRepository + 'static,
{
    /// Spawn the task delivering in-process completions to the notify sink.
    pub fn spawn_completion_pump(
        &self,
        completions: CompletionReceiver,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(run_completion_pump(self.protocol.clone(), completions, cancel))
    }
}
