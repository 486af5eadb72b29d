//! Retry chains.
//!
//! A retried node is never deleted or rewritten in place: a replacement record
//! is inserted and the superseded one is flagged `old_retry`, which hides it
//! from every current-execution query.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use nodeflow_types::error::EngineError;
use nodeflow_types::execution::NodeExecution;
use nodeflow_types::query::{Criterion, FieldUpdate, NodeField, NodeFilter, NodeUpdate, Projection};

use crate::execution::state_machine::StatusStateMachine;
use crate::repository::node_execution::NodeExecutionRepository;

pub struct RetryChain<R: NodeExecutionRepository> {
    state_machine: Arc<StatusStateMachine<R>>,
}

impl<R: NodeExecutionRepository> RetryChain<R> {
    pub fn new(state_machine: Arc<StatusStateMachine<R>>) -> Self {
        Self { state_machine }
    }

    /// Flag `id` as superseded. Returns whether the record exists.
    pub async fn mark_retried(&self, id: Uuid) -> Result<bool, EngineError> {
        let updated = self
            .state_machine
            .store()
            .update_fields(
                id,
                &NodeUpdate::new().set(FieldUpdate::OldRetry(true)),
                &Projection::ids_only(),
            )
            .await?;
        Ok(updated.is_some())
    }

    /// Point every record whose `previous_id` is `old_id` at `new_id`.
    pub async fn relink_retry(&self, old_id: Uuid, new_id: Uuid) -> Result<u64, EngineError> {
        self.state_machine
            .store()
            .update_many(
                &NodeFilter::new().and(Criterion::PreviousId(old_id)),
                &NodeUpdate::new().set(FieldUpdate::PreviousId(new_id)),
            )
            .await
    }

    /// Replace `old_id` with `replacement`.
    ///
    /// The old record is flagged before the replacement is inserted, so at
    /// no point are both current. Records chained after the old one are
    /// relinked before the insert, which leaves the replacement's own
    /// `previous_id = old_id` back-link intact. A failed insert undoes the
    /// flag and the relink.
    pub async fn retry_node(
        &self,
        old_id: Uuid,
        mut replacement: NodeExecution,
    ) -> Result<NodeExecution, EngineError> {
        let old = self
            .state_machine
            .store()
            .get_required(old_id, &Projection::of(&[NodeField::ParentId]))
            .await?;

        self.mark_retried(old_id).await?;
        let relinked = self.relink_retry(old_id, replacement.id).await?;
        replacement.previous_id = Some(old_id);
        if replacement.parent_id.is_none() {
            replacement.parent_id = old.parent_id;
        }
        let replacement_id = replacement.id;
        let created = match self.state_machine.create(replacement).await {
            Ok(created) => created,
            Err(e) => {
                warn!(old_node_execution_id = %old_id, error = %e, "retry insert failed, restoring old record");
                self.restore(old_id, replacement_id).await;
                return Err(e);
            }
        };

        info!(
            old_node_execution_id = %old_id,
            node_execution_id = %created.id,
            relinked,
            "node execution retried"
        );
        Ok(created)
    }

    async fn restore(&self, old_id: Uuid, replacement_id: Uuid) {
        if let Err(e) = self.relink_retry(replacement_id, old_id).await {
            warn!(old_node_execution_id = %old_id, error = %e, "failed to undo retry relink");
        }
        let unflag = NodeUpdate::new().set(FieldUpdate::OldRetry(false));
        if let Err(e) = self
            .state_machine
            .store()
            .update_fields(old_id, &unflag, &Projection::ids_only())
            .await
        {
            warn!(old_node_execution_id = %old_id, error = %e, "failed to undo retry flag");
        }
    }

    /// Every record of the run, old retries included, for audit views.
    pub async fn history(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        self.state_machine
            .store()
            .find(
                &NodeFilter::plan(plan_execution_id),
                &Projection::tree()
                    .with(NodeField::PreviousId)
                    .with(NodeField::StartTs)
                    .with(NodeField::EndTs),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_types::execution::{Ambiance, Status, StepCategory};

    use crate::event::OrchestrationEventBus;
    use crate::execution::observer::ObserverRegistry;
    use crate::execution::store::NodeExecutionStore;
    use crate::store::memory::InMemoryNodeExecutionRepository;

    fn chain() -> (Arc<StatusStateMachine<InMemoryNodeExecutionRepository>>, RetryChain<InMemoryNodeExecutionRepository>) {
        let store = NodeExecutionStore::new(
            InMemoryNodeExecutionRepository::new(),
            Arc::new(ObserverRegistry::new()),
        );
        let sm = Arc::new(StatusStateMachine::new(Arc::new(store), OrchestrationEventBus::new(16)));
        (sm.clone(), RetryChain::new(sm))
    }

    #[tokio::test]
    async fn mark_and_relink() {
        let (sm, chain) = chain();
        let plan = Uuid::now_v7();
        let ambiance = Ambiance::new("acct", plan);
        let a = sm
            .create(NodeExecution::new(ambiance.clone(), "a", "a", StepCategory::Step).with_status(Status::Failed))
            .await
            .unwrap();
        let b = sm
            .create(NodeExecution::new(ambiance.clone(), "a", "a", StepCategory::Step))
            .await
            .unwrap();
        let mut followers = Vec::new();
        for name in ["x", "y"] {
            let mut n = NodeExecution::new(ambiance.clone(), name, name, StepCategory::Step);
            n.previous_id = Some(a.id);
            followers.push(sm.create(n).await.unwrap());
        }

        assert!(chain.mark_retried(a.id).await.unwrap());
        assert_eq!(chain.relink_retry(a.id, b.id).await.unwrap(), 2);

        let store = sm.store();
        let still_on_a = store
            .count(&NodeFilter::new().and(Criterion::PreviousId(a.id)))
            .await
            .unwrap();
        assert_eq!(still_on_a, 0);
        for f in &followers {
            let stored = store.get_required(f.id, &Projection::all()).await.unwrap();
            assert_eq!(stored.previous_id, Some(b.id));
        }

        let current = store
            .find(&NodeFilter::plan(plan).current(), &Projection::ids_only())
            .await
            .unwrap();
        assert!(current.iter().all(|n| n.id != a.id));
        assert_eq!(current.len(), 3);
    }

    #[tokio::test]
    async fn mark_retried_missing_record() {
        let (_, chain) = chain();
        assert!(!chain.mark_retried(Uuid::now_v7()).await.unwrap());
    }

    #[tokio::test]
    async fn retry_node_keeps_back_link_and_history() {
        let (sm, chain) = chain();
        let plan = Uuid::now_v7();
        let ambiance = Ambiance::new("acct", plan);
        let stage = sm
            .create(NodeExecution::new(ambiance.clone(), "s", "s", StepCategory::Stage))
            .await
            .unwrap();
        let old = sm
            .create(
                NodeExecution::new(ambiance.clone(), "a", "a", StepCategory::Step)
                    .with_parent(stage.id)
                    .with_status(Status::Failed),
            )
            .await
            .unwrap();
        let mut next = NodeExecution::new(ambiance.clone(), "b", "b", StepCategory::Step);
        next.previous_id = Some(old.id);
        let next = sm.create(next).await.unwrap();

        let replacement = NodeExecution::new(ambiance, "a", "a", StepCategory::Step);
        let created = chain.retry_node(old.id, replacement).await.unwrap();

        let store = sm.store();
        let stored = store.get_required(created.id, &Projection::all()).await.unwrap();
        assert_eq!(stored.previous_id, Some(old.id));
        assert_eq!(stored.parent_id, Some(stage.id));
        let next = store.get_required(next.id, &Projection::all()).await.unwrap();
        assert_eq!(next.previous_id, Some(created.id));
        let old = store.get_required(old.id, &Projection::all()).await.unwrap();
        assert!(old.old_retry);

        let history = chain.history(plan).await.unwrap();
        assert_eq!(history.len(), 4);
        assert!(history.iter().any(|n| n.old_retry));
    }

    #[tokio::test]
    async fn failed_replacement_insert_restores_old_record() {
        let (sm, chain) = chain();
        let plan = Uuid::now_v7();
        let ambiance = Ambiance::new("acct", plan);
        let old = sm
            .create(NodeExecution::new(ambiance.clone(), "a", "a", StepCategory::Step).with_status(Status::Failed))
            .await
            .unwrap();
        let mut next = NodeExecution::new(ambiance.clone(), "b", "b", StepCategory::Step);
        next.previous_id = Some(old.id);
        let next = sm.create(next).await.unwrap();

        // Reusing an existing id makes the insert conflict.
        let mut replacement = NodeExecution::new(ambiance, "a", "a", StepCategory::Step);
        replacement.id = next.id;
        assert!(chain.retry_node(old.id, replacement).await.is_err());

        let store = sm.store();
        let old = store.get_required(old.id, &Projection::all()).await.unwrap();
        assert!(!old.old_retry);
        let next = store.get_required(next.id, &Projection::all()).await.unwrap();
        assert_eq!(next.previous_id, Some(old.id));
        let current = store
            .count(&NodeFilter::plan(plan).current())
            .await
            .unwrap();
        assert_eq!(current, 2);
    }

    #[tokio::test]
    async fn retry_of_missing_node_fails() {
        let (_, chain) = chain();
        let replacement = NodeExecution::new(Ambiance::new("acct", Uuid::now_v7()), "a", "a", StepCategory::Step);
        assert!(matches!(
            chain.retry_node(Uuid::now_v7(), replacement).await,
            Err(EngineError::NodeNotFound(_))
        ));
    }
}
