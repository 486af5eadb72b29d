//! Orchestration events broadcast by the engine.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{Status, StepCategory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A node execution record was created.
    NodeExecutionStart {
        node_execution_id: Uuid,
        plan_execution_id: Uuid,
        step_category: StepCategory,
    },

    /// A stage changed status, or any node reached a terminal status.
    NodeExecutionStatusUpdate {
        node_execution_id: Uuid,
        plan_execution_id: Uuid,
        step_category: StepCategory,
        status: Status,
    },

    /// All records of a run were deleted.
    PlanExecutionPurged {
        plan_execution_id: Uuid,
        deleted: u64,
    },
}

impl OrchestrationEvent {
    pub fn plan_execution_id(&self) -> Uuid {
        match self {
            OrchestrationEvent::NodeExecutionStart { plan_execution_id, .. }
            | OrchestrationEvent::NodeExecutionStatusUpdate { plan_execution_id, .. }
            | OrchestrationEvent::PlanExecutionPurged { plan_execution_id, .. } => *plan_execution_id,
        }
    }
}
