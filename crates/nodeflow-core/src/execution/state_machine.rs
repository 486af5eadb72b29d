//! Status state machine: the only writer of `NodeExecution::status`.
//!
//! Every status change is a single conditional write at the store ("set
//! status only if the persisted status is an allowed predecessor"). A write
//! that matches nothing means another transition won the race; it is logged
//! and returned as `None`, never raised.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use nodeflow_types::error::EngineError;
use nodeflow_types::event::OrchestrationEvent;
use nodeflow_types::execution::{InterruptHistory, NodeExecution, Status, StepCategory};
use nodeflow_types::query::{FieldUpdate, NodeField, NodeFilter, NodeUpdate, Projection};

use crate::event::OrchestrationEventBus;
use crate::execution::status::allowed_predecessors;
use crate::execution::store::NodeExecutionStore;
use crate::repository::node_execution::{NodeExecutionRepository, StatusChange};

pub struct StatusStateMachine<R: NodeExecutionRepository> {
    store: Arc<NodeExecutionStore<R>>,
    events: OrchestrationEventBus,
}

impl<R: NodeExecutionRepository> StatusStateMachine<R> {
    pub fn new(store: Arc<NodeExecutionStore<R>>, events: OrchestrationEventBus) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<NodeExecutionStore<R>> {
        &self.store
    }

    pub fn events(&self) -> &OrchestrationEventBus {
        &self.events
    }

    /// Insert a new record and notify node-start observers in order.
    pub async fn create(&self, node: NodeExecution) -> Result<NodeExecution, EngineError> {
        self.store.insert(&node).await?;
        self.store.observers().notify_node_start(&node);
        self.events.publish(OrchestrationEvent::NodeExecutionStart {
            node_execution_id: node.id,
            plan_execution_id: node.plan_execution_id,
            step_category: node.step_category,
        });
        info!(
            node_execution_id = %node.id,
            plan_execution_id = %node.plan_execution_id,
            identifier = %node.identifier,
            "node execution started"
        );
        Ok(node)
    }

    /// Move `id` into `target` if its persisted status is an allowed
    /// predecessor of `target` or is listed in `overrides`.
    ///
    /// `None` means no record matched: either the id does not exist or a
    /// concurrent transition already moved it. Callers must not retry.
    pub async fn transition(
        &self,
        id: Uuid,
        target: Status,
        update: NodeUpdate,
        overrides: &[Status],
    ) -> Result<Option<NodeExecution>, EngineError> {
        self.transition_projected(id, target, update, overrides, &Projection::status_update())
            .await
    }

    /// `transition`, reading back `projection` (plus the fields the state
    /// machine itself needs).
    pub async fn transition_projected(
        &self,
        id: Uuid,
        target: Status,
        update: NodeUpdate,
        overrides: &[Status],
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, EngineError> {
        projection.validate()?;
        let projection = projection
            .clone()
            .with(NodeField::PlanExecutionId)
            .with(NodeField::Status)
            .with(NodeField::StepCategory);

        let mut allowed = allowed_predecessors(target);
        for status in overrides {
            if !allowed.contains(status) {
                allowed.push(*status);
            }
        }

        let change = StatusChange::new(target, update);
        match self.store.transition(id, &allowed, &change, &projection).await? {
            Some(node) => {
                debug!(node_execution_id = %id, status = ?target, "status transitioned");
                self.after_transition(&node);
                Ok(Some(node))
            }
            None => {
                warn!(
                    node_execution_id = %id,
                    target = ?target,
                    "status transition matched no record, ignoring"
                );
                Ok(None)
            }
        }
    }

    /// Non-status field update. Stamps `last_updated_at`.
    pub async fn update(
        &self,
        id: Uuid,
        update: NodeUpdate,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, EngineError> {
        let updated = self.store.update_fields(id, &update, projection).await?;
        if updated.is_none() {
            warn!(node_execution_id = %id, "field update matched no record");
        }
        Ok(updated)
    }

    /// Move every record matching `filter` whose status is an allowed
    /// predecessor of `target`, in one bulk write. Returns the count.
    pub async fn bulk_transition(&self, filter: NodeFilter, target: Status) -> Result<u64, EngineError> {
        let filter = filter.status_in(allowed_predecessors(target));
        let change = StatusChange::new(target, NodeUpdate::new());
        let changed = self.store.transition_many(&filter, &change).await?;
        info!(target = ?target, changed, "bulk status transition");
        Ok(changed)
    }

    /// ERRORED for every current non-terminal record of the run.
    /// Returns whether anything changed.
    pub async fn error_out_active_nodes(&self, plan_execution_id: Uuid) -> Result<bool, EngineError> {
        let changed = self
            .bulk_transition(NodeFilter::plan(plan_execution_id).current(), Status::Errored)
            .await?;
        Ok(changed > 0)
    }

    /// DISCONTINUING for an explicit id list (capped at the batch size).
    pub async fn mark_leaves_discontinuing(&self, ids: &[Uuid]) -> Result<u64, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.bulk_transition(NodeFilter::new().ids(ids.to_vec()), Status::Discontinuing)
            .await
    }

    /// Append an interrupt to the record's audit trail.
    pub async fn append_interrupt(
        &self,
        id: Uuid,
        history: InterruptHistory,
    ) -> Result<Option<NodeExecution>, EngineError> {
        self.update(
            id,
            NodeUpdate::new().set(FieldUpdate::AddInterruptHistory(history)),
            &Projection::of(&[NodeField::InterruptHistories]),
        )
        .await
    }

    fn after_transition(&self, node: &NodeExecution) {
        self.store.observers().notify_status_update(node);
        if node.step_category == StepCategory::Stage || node.status.is_final() {
            self.events.publish(OrchestrationEvent::NodeExecutionStatusUpdate {
                node_execution_id: node.id,
                plan_execution_id: node.plan_execution_id,
                step_category: node.step_category,
                status: node.status,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use nodeflow_types::execution::{Ambiance, InterruptType};

    use crate::execution::observer::{NodeStartObserver, ObserverRegistry, StatusUpdateObserver};
    use crate::store::memory::InMemoryNodeExecutionRepository;

    type Machine = StatusStateMachine<InMemoryNodeExecutionRepository>;

    fn machine_with(observers: ObserverRegistry) -> Machine {
        let store = NodeExecutionStore::new(InMemoryNodeExecutionRepository::new(), Arc::new(observers));
        StatusStateMachine::new(Arc::new(store), OrchestrationEventBus::new(64))
    }

    fn machine() -> Machine {
        machine_with(ObserverRegistry::new())
    }

    fn node(status: Status, category: StepCategory) -> NodeExecution {
        NodeExecution::new(Ambiance::new("acct", Uuid::now_v7()), "n", "step", category)
            .with_status(status)
    }

    #[tokio::test]
    async fn transition_from_allowed_predecessor() {
        let sm = machine();
        let n = sm.create(node(Status::Queued, StepCategory::Step)).await.unwrap();

        let running = sm
            .transition(n.id, Status::Running, NodeUpdate::new(), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, Status::Running);
        assert!(running.end_ts.is_none());

        let done = sm
            .transition(n.id, Status::Succeeded, NodeUpdate::new(), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, Status::Succeeded);
        assert!(done.end_ts.is_some());
    }

    #[tokio::test]
    async fn terminal_record_never_moves_again() {
        let sm = machine();
        let n = sm.create(node(Status::Running, StepCategory::Step)).await.unwrap();
        sm.transition(n.id, Status::Failed, NodeUpdate::new(), &[])
            .await
            .unwrap()
            .unwrap();

        for target in Status::ALL {
            let result = sm.transition(n.id, target, NodeUpdate::new(), &[]).await.unwrap();
            assert!(result.is_none(), "FAILED moved to {target}");
        }
    }

    #[tokio::test]
    async fn missing_record_is_none_not_error() {
        let sm = machine();
        let result = sm
            .transition(Uuid::now_v7(), Status::Aborted, NodeUpdate::new(), &[])
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn override_widens_predecessors() {
        let sm = machine();
        let n = sm.create(node(Status::Queued, StepCategory::Step)).await.unwrap();
        assert!(
            sm.transition(n.id, Status::ApprovalRejected, NodeUpdate::new(), &[])
                .await
                .unwrap()
                .is_none()
        );
        let rejected = sm
            .transition(n.id, Status::ApprovalRejected, NodeUpdate::new(), &[Status::Queued])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.status, Status::ApprovalRejected);
    }

    #[tokio::test]
    async fn expired_keeps_timeout_ids() {
        let sm = machine();
        let mut n = node(Status::Running, StepCategory::Step);
        n.timeout_instance_ids = vec!["t1".into()];
        let n = sm.create(n).await.unwrap();

        sm.transition(n.id, Status::Expired, NodeUpdate::new(), &[])
            .await
            .unwrap()
            .unwrap();
        let stored = sm.store().get_required(n.id, &Projection::all()).await.unwrap();
        assert_eq!(stored.timeout_instance_ids, vec!["t1".to_string()]);
        assert!(stored.end_ts.is_some());
    }

    #[tokio::test]
    async fn aborted_clears_timeout_ids() {
        let sm = machine();
        let mut n = node(Status::Running, StepCategory::Step);
        n.timeout_instance_ids = vec!["t1".into()];
        let n = sm.create(n).await.unwrap();

        sm.transition(n.id, Status::Aborted, NodeUpdate::new(), &[])
            .await
            .unwrap()
            .unwrap();
        let stored = sm.store().get_required(n.id, &Projection::all()).await.unwrap();
        assert!(stored.timeout_instance_ids.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_terminal_transitions_exactly_one_wins() {
        for _ in 0..20 {
            let sm = Arc::new(machine());
            let n = sm.create(node(Status::Running, StepCategory::Step)).await.unwrap();

            let a = {
                let sm = sm.clone();
                tokio::spawn(async move {
                    sm.transition(n.id, Status::Succeeded, NodeUpdate::new(), &[]).await
                })
            };
            let b = {
                let sm = sm.clone();
                tokio::spawn(async move {
                    sm.transition(n.id, Status::Failed, NodeUpdate::new(), &[]).await
                })
            };

            let a = a.await.unwrap().unwrap();
            let b = b.await.unwrap().unwrap();
            assert!(a.is_some() ^ b.is_some(), "exactly one transition must win");

            let stored = sm.store().get_required(n.id, &Projection::all()).await.unwrap();
            let winner = a.or(b).unwrap();
            assert_eq!(stored.status, winner.status);
        }
    }

    #[tokio::test]
    async fn stage_and_terminal_transitions_publish_events() {
        let sm = machine();
        let mut rx = sm.events().subscribe();
        let stage = sm.create(node(Status::Queued, StepCategory::Stage)).await.unwrap();
        let step = sm.create(node(Status::Queued, StepCategory::Step)).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), OrchestrationEvent::NodeExecutionStart { .. }));
        assert!(matches!(rx.recv().await.unwrap(), OrchestrationEvent::NodeExecutionStart { .. }));

        sm.transition(stage.id, Status::Running, NodeUpdate::new(), &[]).await.unwrap();
        sm.transition(step.id, Status::Running, NodeUpdate::new(), &[]).await.unwrap();
        sm.transition(step.id, Status::Succeeded, NodeUpdate::new(), &[]).await.unwrap();

        match rx.recv().await.unwrap() {
            OrchestrationEvent::NodeExecutionStatusUpdate { node_execution_id, status, .. } => {
                assert_eq!(node_execution_id, stage.id);
                assert_eq!(status, Status::Running);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            OrchestrationEvent::NodeExecutionStatusUpdate { node_execution_id, status, .. } => {
                assert_eq!(node_execution_id, step.id);
                assert_eq!(status, Status::Succeeded);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    struct Log(Arc<Mutex<Vec<String>>>, &'static str);

    impl NodeStartObserver for Log {
        fn on_node_start(&self, node: &NodeExecution) {
            self.0.lock().unwrap().push(format!("{}:start:{}", self.1, node.identifier));
        }
    }

    impl StatusUpdateObserver for Log {
        fn on_status_update(&self, node: &NodeExecution) {
            self.0.lock().unwrap().push(format!("{}:{}", self.1, node.status));
        }
    }

    #[tokio::test]
    async fn observers_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Log(log.clone(), "first"));
        let second = Arc::new(Log(log.clone(), "second"));
        let mut observers = ObserverRegistry::new();
        observers.register_node_start(first.clone());
        observers.register_node_start(second.clone());
        observers.register_status_update(first);
        observers.register_status_update(second);
        let sm = machine_with(observers);

        let n = sm.create(node(Status::Queued, StepCategory::Step)).await.unwrap();
        sm.transition(n.id, Status::Running, NodeUpdate::new(), &[]).await.unwrap();
        // A stale transition notifies nobody.
        sm.transition(n.id, Status::Queued, NodeUpdate::new(), &[]).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:start:step",
                "second:start:step",
                "first:RUNNING",
                "second:RUNNING"
            ]
        );
    }

    #[tokio::test]
    async fn error_out_active_nodes_skips_terminal_and_old_retries() {
        let sm = machine();
        let plan = Uuid::now_v7();
        let ambiance = Ambiance::new("acct", plan);
        let running = NodeExecution::new(ambiance.clone(), "a", "a", StepCategory::Step)
            .with_status(Status::Running);
        let done = NodeExecution::new(ambiance.clone(), "b", "b", StepCategory::Step)
            .with_status(Status::Succeeded);
        let mut old = NodeExecution::new(ambiance, "c", "c", StepCategory::Step)
            .with_status(Status::Running);
        old.old_retry = true;
        for n in [&running, &done, &old] {
            sm.create(n.clone()).await.unwrap();
        }

        assert!(sm.error_out_active_nodes(plan).await.unwrap());
        let store = sm.store();
        assert_eq!(store.get_required(running.id, &Projection::all()).await.unwrap().status, Status::Errored);
        assert_eq!(store.get_required(done.id, &Projection::all()).await.unwrap().status, Status::Succeeded);
        assert_eq!(store.get_required(old.id, &Projection::all()).await.unwrap().status, Status::Running);

        assert!(!sm.error_out_active_nodes(plan).await.unwrap());
    }

    #[tokio::test]
    async fn update_stamps_last_updated_at() {
        let sm = machine();
        let n = sm.create(node(Status::Running, StepCategory::Step)).await.unwrap();
        let before = n.last_updated_at;

        let updated = sm
            .append_interrupt(n.id, InterruptHistory::new(InterruptType::Abort, "ops"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.interrupt_histories.len(), 1);

        let stored = sm.store().get_required(n.id, &Projection::all()).await.unwrap();
        assert!(stored.last_updated_at >= before);
        assert_eq!(stored.interrupt_histories[0].issued_by, "ops");
    }

    #[tokio::test]
    async fn mark_leaves_discontinuing_rejects_oversized_batch() {
        let sm = machine();
        let ids: Vec<Uuid> = (0..1001).map(|_| Uuid::now_v7()).collect();
        assert!(matches!(
            sm.mark_leaves_discontinuing(&ids).await,
            Err(EngineError::Validation(_))
        ));
    }
}
