//! Query, projection and field-update values for the execution store.
//!
//! These are plain data: the core crate validates them and hands them to a
//! repository, which translates them into its own query language (SQL for
//! SQLite, a predicate for the in-memory store).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::execution::{
    ExecutableResponse, ExecutionMode, FailureInfo, InterruptHistory, NodeExecution, Status,
    StepCategory,
};

/// Default cap on the number of ids in a single `IN` criterion.
pub const MAX_BATCH_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// Fields & projections
// ---------------------------------------------------------------------------

/// A persisted field of `NodeExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeField {
    Id,
    PlanExecutionId,
    NodeId,
    ParentId,
    PreviousId,
    NextId,
    StageFqn,
    Identifier,
    Name,
    StepType,
    StepCategory,
    Mode,
    Status,
    OldRetry,
    CreatedAt,
    LastUpdatedAt,
    StartTs,
    EndTs,
    TimeoutInstanceIds,
    ResolvedParameters,
    ExecutableResponses,
    Outcome,
    FailureInfo,
    InterruptHistories,
    Ambiance,
    Version,
}

impl NodeField {
    pub const ALL: [NodeField; 26] = [
        NodeField::Id,
        NodeField::PlanExecutionId,
        NodeField::NodeId,
        NodeField::ParentId,
        NodeField::PreviousId,
        NodeField::NextId,
        NodeField::StageFqn,
        NodeField::Identifier,
        NodeField::Name,
        NodeField::StepType,
        NodeField::StepCategory,
        NodeField::Mode,
        NodeField::Status,
        NodeField::OldRetry,
        NodeField::CreatedAt,
        NodeField::LastUpdatedAt,
        NodeField::StartTs,
        NodeField::EndTs,
        NodeField::TimeoutInstanceIds,
        NodeField::ResolvedParameters,
        NodeField::ExecutableResponses,
        NodeField::Outcome,
        NodeField::FailureInfo,
        NodeField::InterruptHistories,
        NodeField::Ambiance,
        NodeField::Version,
    ];

    /// Storage column name.
    pub fn column(self) -> &'static str {
        match self {
            NodeField::Id => "id",
            NodeField::PlanExecutionId => "plan_execution_id",
            NodeField::NodeId => "node_id",
            NodeField::ParentId => "parent_id",
            NodeField::PreviousId => "previous_id",
            NodeField::NextId => "next_id",
            NodeField::StageFqn => "stage_fqn",
            NodeField::Identifier => "identifier",
            NodeField::Name => "name",
            NodeField::StepType => "step_type",
            NodeField::StepCategory => "step_category",
            NodeField::Mode => "mode",
            NodeField::Status => "status",
            NodeField::OldRetry => "old_retry",
            NodeField::CreatedAt => "created_at",
            NodeField::LastUpdatedAt => "last_updated_at",
            NodeField::StartTs => "start_ts",
            NodeField::EndTs => "end_ts",
            NodeField::TimeoutInstanceIds => "timeout_instance_ids",
            NodeField::ResolvedParameters => "resolved_parameters",
            NodeField::ExecutableResponses => "executable_responses",
            NodeField::Outcome => "outcome",
            NodeField::FailureInfo => "failure_info",
            NodeField::InterruptHistories => "interrupt_histories",
            NodeField::Ambiance => "ambiance",
            NodeField::Version => "version",
        }
    }
}

/// Explicit set of fields to read. Must be non-empty.
///
/// `Id` is always read back even when not listed, so a projected record can
/// be correlated with its source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Projection {
    fields: BTreeSet<NodeField>,
}

impl Projection {
    pub fn of(fields: &[NodeField]) -> Self {
        Self {
            fields: fields.iter().copied().collect(),
        }
    }

    /// Every field. Reserved for single-document reads that genuinely need the
    /// whole record.
    pub fn all() -> Self {
        Self::of(&NodeField::ALL)
    }

    pub fn ids_only() -> Self {
        Self::of(&[NodeField::Id])
    }

    /// Fields needed to walk and render the execution tree.
    pub fn tree() -> Self {
        Self::of(&[
            NodeField::Id,
            NodeField::PlanExecutionId,
            NodeField::ParentId,
            NodeField::NodeId,
            NodeField::Identifier,
            NodeField::Name,
            NodeField::Status,
            NodeField::StepCategory,
            NodeField::Mode,
            NodeField::OldRetry,
            NodeField::CreatedAt,
        ])
    }

    /// Fields needed by the state machine's event emission and observers.
    pub fn status_update() -> Self {
        Self::of(&[
            NodeField::Id,
            NodeField::PlanExecutionId,
            NodeField::NodeId,
            NodeField::ParentId,
            NodeField::Identifier,
            NodeField::Status,
            NodeField::StepCategory,
            NodeField::StepType,
            NodeField::Mode,
            NodeField::EndTs,
            NodeField::Ambiance,
        ])
    }

    /// Fields needed to resume a pipeline from a stage.
    pub fn stage_summary() -> Self {
        Self::of(&[
            NodeField::Id,
            NodeField::ParentId,
            NodeField::NextId,
            NodeField::Identifier,
            NodeField::Name,
            NodeField::StageFqn,
            NodeField::Status,
            NodeField::StepCategory,
            NodeField::CreatedAt,
            NodeField::OldRetry,
        ])
    }

    /// Fields needed to resolve a callback into a terminal status.
    pub fn callback() -> Self {
        Self::of(&[
            NodeField::Id,
            NodeField::PlanExecutionId,
            NodeField::Status,
            NodeField::StepType,
            NodeField::StepCategory,
            NodeField::ExecutableResponses,
            NodeField::ResolvedParameters,
            NodeField::Ambiance,
        ])
    }

    pub fn with(mut self, field: NodeField) -> Self {
        self.fields.insert(field);
        self
    }

    pub fn contains(&self, field: NodeField) -> bool {
        field == NodeField::Id || self.fields.contains(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fields.is_empty() {
            return Err(ValidationError::EmptyProjection);
        }
        Ok(())
    }

    /// Fields to read, always including `Id`.
    pub fn fields(&self) -> Vec<NodeField> {
        let mut set = self.fields.clone();
        set.insert(NodeField::Id);
        set.into_iter().collect()
    }

    /// Copy only the projected fields of `source` onto a default record.
    pub fn apply(&self, source: &NodeExecution) -> NodeExecution {
        let mut out = NodeExecution {
            id: source.id,
            ..Default::default()
        };
        for field in self.fields() {
            match field {
                NodeField::Id => {}
                NodeField::PlanExecutionId => out.plan_execution_id = source.plan_execution_id,
                NodeField::NodeId => out.node_id = source.node_id.clone(),
                NodeField::ParentId => out.parent_id = source.parent_id,
                NodeField::PreviousId => out.previous_id = source.previous_id,
                NodeField::NextId => out.next_id = source.next_id,
                NodeField::StageFqn => out.stage_fqn = source.stage_fqn.clone(),
                NodeField::Identifier => out.identifier = source.identifier.clone(),
                NodeField::Name => out.name = source.name.clone(),
                NodeField::StepType => out.step_type = source.step_type.clone(),
                NodeField::StepCategory => out.step_category = source.step_category,
                NodeField::Mode => out.mode = source.mode,
                NodeField::Status => out.status = source.status,
                NodeField::OldRetry => out.old_retry = source.old_retry,
                NodeField::CreatedAt => out.created_at = source.created_at,
                NodeField::LastUpdatedAt => out.last_updated_at = source.last_updated_at,
                NodeField::StartTs => out.start_ts = source.start_ts,
                NodeField::EndTs => out.end_ts = source.end_ts,
                NodeField::TimeoutInstanceIds => {
                    out.timeout_instance_ids = source.timeout_instance_ids.clone()
                }
                NodeField::ResolvedParameters => {
                    out.resolved_parameters = source.resolved_parameters.clone()
                }
                NodeField::ExecutableResponses => {
                    out.executable_responses = source.executable_responses.clone()
                }
                NodeField::Outcome => out.outcome = source.outcome.clone(),
                NodeField::FailureInfo => out.failure_info = source.failure_info.clone(),
                NodeField::InterruptHistories => {
                    out.interrupt_histories = source.interrupt_histories.clone()
                }
                NodeField::Ambiance => out.ambiance = source.ambiance.clone(),
                NodeField::Version => out.version = source.version,
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// A single predicate over a node execution record.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    IdIn(Vec<Uuid>),
    PlanExecutionId(Uuid),
    ParentId(Uuid),
    ParentIdIn(Vec<Uuid>),
    PreviousId(Uuid),
    NodeIdIn(Vec<String>),
    StatusIn(Vec<Status>),
    StatusNotIn(Vec<Status>),
    CategoryIn(Vec<StepCategory>),
    ModeIn(Vec<ExecutionMode>),
    OldRetry(bool),
    StageFqnIn(Vec<String>),
    IdentifierIn(Vec<String>),
}

impl Criterion {
    pub fn matches(&self, node: &NodeExecution) -> bool {
        match self {
            Criterion::IdIn(ids) => ids.contains(&node.id),
            Criterion::PlanExecutionId(id) => node.plan_execution_id == *id,
            Criterion::ParentId(id) => node.parent_id == Some(*id),
            Criterion::ParentIdIn(ids) => node.parent_id.is_some_and(|p| ids.contains(&p)),
            Criterion::PreviousId(id) => node.previous_id == Some(*id),
            Criterion::NodeIdIn(ids) => ids.contains(&node.node_id),
            Criterion::StatusIn(statuses) => statuses.contains(&node.status),
            Criterion::StatusNotIn(statuses) => !statuses.contains(&node.status),
            Criterion::CategoryIn(categories) => categories.contains(&node.step_category),
            Criterion::ModeIn(modes) => node.mode.is_some_and(|m| modes.contains(&m)),
            Criterion::OldRetry(flag) => node.old_retry == *flag,
            Criterion::StageFqnIn(fqns) => node
                .stage_fqn
                .as_ref()
                .is_some_and(|fqn| fqns.contains(fqn)),
            Criterion::IdentifierIn(identifiers) => identifiers.contains(&node.identifier),
        }
    }

    fn batch_len(&self) -> usize {
        match self {
            Criterion::IdIn(v) => v.len(),
            Criterion::ParentIdIn(v) => v.len(),
            Criterion::NodeIdIn(v) => v.len(),
            Criterion::StageFqnIn(v) => v.len(),
            Criterion::IdentifierIn(v) => v.len(),
            _ => 0,
        }
    }
}

/// Conjunction of criteria, optionally further constrained by a disjunction
/// of nested filters: `all(criteria) AND (any(alternatives) if non-empty)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeFilter {
    pub criteria: Vec<Criterion>,
    pub any_of: Vec<NodeFilter>,
}

impl NodeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(plan_execution_id: Uuid) -> Self {
        Self::new().and(Criterion::PlanExecutionId(plan_execution_id))
    }

    pub fn and(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// Restrict to current records (`old_retry = false`).
    pub fn current(self) -> Self {
        self.and(Criterion::OldRetry(false))
    }

    pub fn status_in(self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.and(Criterion::StatusIn(statuses.into_iter().collect()))
    }

    pub fn ids(self, ids: Vec<Uuid>) -> Self {
        self.and(Criterion::IdIn(ids))
    }

    pub fn or(mut self, alternative: NodeFilter) -> Self {
        self.any_of.push(alternative);
        self
    }

    pub fn matches(&self, node: &NodeExecution) -> bool {
        self.criteria.iter().all(|c| c.matches(node))
            && (self.any_of.is_empty() || self.any_of.iter().any(|f| f.matches(node)))
    }

    /// Reject `IN` lists longer than `max_batch_size`.
    pub fn validate(&self, max_batch_size: usize) -> Result<(), ValidationError> {
        for criterion in &self.criteria {
            let len = criterion.batch_len();
            if len > max_batch_size {
                return Err(ValidationError::BatchTooLarge {
                    size: len,
                    max: max_batch_size,
                });
            }
        }
        for nested in &self.any_of {
            nested.validate(max_batch_size)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Field updates
// ---------------------------------------------------------------------------

/// One non-status field mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Mode(ExecutionMode),
    StartTs(DateTime<Utc>),
    NextId(Uuid),
    PreviousId(Uuid),
    OldRetry(bool),
    TimeoutInstanceIds(Vec<String>),
    ResolvedParameters(serde_json::Value),
    Outcome(serde_json::Value),
    FailureInfo(FailureInfo),
    AddExecutableResponse(ExecutableResponse),
    AddInterruptHistory(InterruptHistory),
}

/// Ordered list of field mutations applied atomically to one record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeUpdate {
    pub ops: Vec<FieldUpdate>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, op: FieldUpdate) -> Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether this update touches payload fields worth logging at info level.
    pub fn should_log(&self) -> bool {
        self.ops.iter().any(|op| {
            matches!(
                op,
                FieldUpdate::AddExecutableResponse(_) | FieldUpdate::FailureInfo(_)
            )
        })
    }

    /// Apply the mutations to an in-memory record.
    pub fn apply(&self, node: &mut NodeExecution) {
        for op in &self.ops {
            match op {
                FieldUpdate::Mode(mode) => node.mode = Some(*mode),
                FieldUpdate::StartTs(ts) => node.start_ts = Some(*ts),
                FieldUpdate::NextId(id) => node.next_id = Some(*id),
                FieldUpdate::PreviousId(id) => node.previous_id = Some(*id),
                FieldUpdate::OldRetry(flag) => node.old_retry = *flag,
                FieldUpdate::TimeoutInstanceIds(ids) => node.timeout_instance_ids = ids.clone(),
                FieldUpdate::ResolvedParameters(v) => node.resolved_parameters = Some(v.clone()),
                FieldUpdate::Outcome(v) => node.outcome = Some(v.clone()),
                FieldUpdate::FailureInfo(info) => node.failure_info = Some(info.clone()),
                FieldUpdate::AddExecutableResponse(r) => node.executable_responses.push(r.clone()),
                FieldUpdate::AddInterruptHistory(h) => node.interrupt_histories.push(h.clone()),
            }
        }
    }
}
