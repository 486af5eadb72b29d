//! Serializable views shared by the CLI and the HTTP handlers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use nodeflow_core::execution::tree::{Adjacency, flatten};
use nodeflow_types::execution::{ExecutionMode, Status, StepCategory};

/// One line of a rendered execution tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeRow {
    pub depth: usize,
    pub node_execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub identifier: String,
    pub name: String,
    pub step_category: StepCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    pub status: Status,
    pub old_retry: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
}

/// Pre-order rows of every tree in the run.
pub fn tree_rows(adjacency: &Adjacency) -> Vec<TreeRow> {
    flatten(adjacency)
        .into_iter()
        .map(|(depth, node)| TreeRow {
            depth,
            node_execution_id: node.id,
            parent_id: node.parent_id,
            identifier: node.identifier,
            name: node.name,
            step_category: node.step_category,
            mode: node.mode,
            status: node.status,
            old_retry: node.old_retry,
            start_ts: node.start_ts,
            end_ts: node.end_ts,
        })
        .collect()
}
