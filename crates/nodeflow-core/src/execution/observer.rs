//! In-process observers of node lifecycle changes.
//!
//! Observers are registered on an `ObserverRegistry` at startup, before the
//! registry is shared. Delivery is synchronous and follows registration order.

use std::sync::Arc;

use uuid::Uuid;

use nodeflow_types::execution::NodeExecution;

/// Notified after a node execution record is created.
pub trait NodeStartObserver: Send + Sync {
    fn on_node_start(&self, node: &NodeExecution);
}

/// Notified after a successful status transition.
pub trait StatusUpdateObserver: Send + Sync {
    fn on_status_update(&self, node: &NodeExecution);
}

/// Notified once per deleted batch during a purge.
pub trait NodeDeleteObserver: Send + Sync {
    fn on_nodes_deleted(&self, plan_execution_id: Uuid, ids: &[Uuid]);
}

/// Ordered lists of registered observers.
#[derive(Default)]
pub struct ObserverRegistry {
    start: Vec<Arc<dyn NodeStartObserver>>,
    status_update: Vec<Arc<dyn StatusUpdateObserver>>,
    delete: Vec<Arc<dyn NodeDeleteObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node_start(&mut self, observer: Arc<dyn NodeStartObserver>) {
        self.start.push(observer);
    }

    pub fn register_status_update(&mut self, observer: Arc<dyn StatusUpdateObserver>) {
        self.status_update.push(observer);
    }

    pub fn register_node_delete(&mut self, observer: Arc<dyn NodeDeleteObserver>) {
        self.delete.push(observer);
    }

    pub fn notify_node_start(&self, node: &NodeExecution) {
        for observer in &self.start {
            observer.on_node_start(node);
        }
    }

    pub fn notify_status_update(&self, node: &NodeExecution) {
        for observer in &self.status_update {
            observer.on_status_update(node);
        }
    }

    pub fn notify_nodes_deleted(&self, plan_execution_id: Uuid, ids: &[Uuid]) {
        for observer in &self.delete {
            observer.on_nodes_deleted(plan_execution_id, ids);
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("start", &self.start.len())
            .field("status_update", &self.status_update.len())
            .field("delete", &self.delete.len())
            .finish()
    }
}
