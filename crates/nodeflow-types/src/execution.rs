//! Node execution domain types.
//!
//! A `NodeExecution` is one concrete run of a single pipeline-graph node
//! (pipeline, stage, strategy group, step group or step). Records for one
//! pipeline run share a `plan_execution_id` and form a tree via `parent_id`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Closed set of node execution statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    InterventionWaiting,
    ApprovalWaiting,
    InputWaiting,
    ResourceWaiting,
    QueuedLicenseLimitReached,
    Pausing,
    Paused,
    Discontinuing,
    Aborted,
    Expired,
    Errored,
    Failed,
    ApprovalRejected,
    Skipped,
    Succeeded,
    IgnoreFailed,
}

impl Status {
    pub const ALL: [Status; 20] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::InterventionWaiting,
        Status::ApprovalWaiting,
        Status::InputWaiting,
        Status::ResourceWaiting,
        Status::QueuedLicenseLimitReached,
        Status::Pausing,
        Status::Paused,
        Status::Discontinuing,
        Status::Aborted,
        Status::Expired,
        Status::Errored,
        Status::Failed,
        Status::ApprovalRejected,
        Status::Skipped,
        Status::Succeeded,
        Status::IgnoreFailed,
    ];

    /// Terminal statuses have no outgoing transition.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Aborted
                | Status::Expired
                | Status::Errored
                | Status::Skipped
                | Status::ApprovalRejected
                | Status::IgnoreFailed
        )
    }

    /// Statuses in which the engine is actively moving the node forward.
    pub fn is_flowing(self) -> bool {
        matches!(
            self,
            Status::Queued
                | Status::Running
                | Status::AsyncWaiting
                | Status::TaskWaiting
                | Status::Discontinuing
                | Status::Pausing
        )
    }

    /// Terminal statuses that count as a broken run.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Errored | Status::Expired | Status::ApprovalRejected
        )
    }

    /// All non-terminal statuses.
    pub fn active() -> Vec<Status> {
        Self::ALL.into_iter().filter(|s| !s.is_final()).collect()
    }

    /// Wire/storage representation (`RUNNING`, `ASYNC_WAITING`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::ApprovalWaiting => "APPROVAL_WAITING",
            Status::InputWaiting => "INPUT_WAITING",
            Status::ResourceWaiting => "RESOURCE_WAITING",
            Status::QueuedLicenseLimitReached => "QUEUED_LICENSE_LIMIT_REACHED",
            Status::Pausing => "PAUSING",
            Status::Paused => "PAUSED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Errored => "ERRORED",
            Status::Failed => "FAILED",
            Status::ApprovalRejected => "APPROVAL_REJECTED",
            Status::Skipped => "SKIPPED",
            Status::Succeeded => "SUCCEEDED",
            Status::IgnoreFailed => "IGNORE_FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Step category / execution mode
// ---------------------------------------------------------------------------

/// Structural category of the graph node a record executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCategory {
    Pipeline,
    Stage,
    Strategy,
    StepGroup,
    Fork,
    #[default]
    Step,
}

impl StepCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            StepCategory::Pipeline => "PIPELINE",
            StepCategory::Stage => "STAGE",
            StepCategory::Strategy => "STRATEGY",
            StepCategory::StepGroup => "STEP_GROUP",
            StepCategory::Fork => "FORK",
            StepCategory::Step => "STEP",
        }
    }
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PIPELINE" => Ok(StepCategory::Pipeline),
            "STAGE" => Ok(StepCategory::Stage),
            "STRATEGY" => Ok(StepCategory::Strategy),
            "STEP_GROUP" => Ok(StepCategory::StepGroup),
            "FORK" => Ok(StepCategory::Fork),
            "STEP" => Ok(StepCategory::Step),
            other => Err(format!("unknown step category '{other}'")),
        }
    }
}

/// How a node's work is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    AsyncChain,
    Task,
    TaskChain,
    Child,
    Children,
    ChildChain,
}

impl ExecutionMode {
    /// Leaf modes execute work themselves instead of spawning child nodes.
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            ExecutionMode::Sync
                | ExecutionMode::Async
                | ExecutionMode::AsyncChain
                | ExecutionMode::Task
                | ExecutionMode::TaskChain
        )
    }

    pub fn leaf_modes() -> Vec<ExecutionMode> {
        vec![
            ExecutionMode::Sync,
            ExecutionMode::Async,
            ExecutionMode::AsyncChain,
            ExecutionMode::Task,
            ExecutionMode::TaskChain,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::AsyncChain => "ASYNC_CHAIN",
            ExecutionMode::Task => "TASK",
            ExecutionMode::TaskChain => "TASK_CHAIN",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
            ExecutionMode::ChildChain => "CHILD_CHAIN",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SYNC" => Ok(ExecutionMode::Sync),
            "ASYNC" => Ok(ExecutionMode::Async),
            "ASYNC_CHAIN" => Ok(ExecutionMode::AsyncChain),
            "TASK" => Ok(ExecutionMode::Task),
            "TASK_CHAIN" => Ok(ExecutionMode::TaskChain),
            "CHILD" => Ok(ExecutionMode::Child),
            "CHILDREN" => Ok(ExecutionMode::Children),
            "CHILD_CHAIN" => Ok(ExecutionMode::ChildChain),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Ambiance
// ---------------------------------------------------------------------------

/// Execution context threaded through a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub plan_execution_id: Uuid,
    /// Ancestor path, outermost first.
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<serde_json::Value>,
}

impl Ambiance {
    pub fn new(account_id: impl Into<String>, plan_execution_id: Uuid) -> Self {
        Self {
            account_id: account_id.into(),
            plan_execution_id,
            ..Default::default()
        }
    }

    /// Return a copy with one more level appended.
    pub fn child(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }
}

/// One entry in the ambiance ancestor path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub node_execution_id: Uuid,
    pub node_id: String,
    pub identifier: String,
    pub step_category: StepCategory,
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Descriptor of pending work recorded on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync,
    Async { callback_ids: Vec<String> },
    Task { task_id: String },
    Child { child_node_id: String },
}

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    #[default]
    Application,
    Connectivity,
    Authentication,
    Timeout,
    Executor,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_type: FailureType,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            message: message.into(),
            failure_type,
        }
    }
}

/// Kind of interrupt signal recorded in a node's audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    AbortAll,
    Retry,
    MarkSuccess,
    Pause,
    Resume,
    Expire,
}

/// Audit entry for an abort/retry/pause signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptHistory {
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
}

impl InterruptHistory {
    pub fn new(interrupt_type: InterruptType, issued_by: impl Into<String>) -> Self {
        Self {
            interrupt_id: Uuid::now_v7(),
            interrupt_type,
            issued_by: issued_by.into(),
            issued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeExecution
// ---------------------------------------------------------------------------

/// One concrete execution of a pipeline graph node.
///
/// Records read through a partial projection carry `Default` values in every
/// field that was not projected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    /// Graph-node template this record executes.
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// The record this one retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Uuid>,
    /// Sibling that runs after this one (stage/step chains).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_fqn: Option<String>,
    pub identifier: String,
    pub name: String,
    pub step_type: String,
    pub step_category: StepCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    pub status: Status,
    #[serde(default)]
    pub old_retry: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_instance_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub interrupt_histories: Vec<InterruptHistory>,
    pub ambiance: Ambiance,
    /// Optimistic concurrency token for full-document saves.
    pub version: i64,
}

impl NodeExecution {
    /// Build a fresh QUEUED record for a graph node.
    pub fn new(
        ambiance: Ambiance,
        node_id: impl Into<String>,
        identifier: impl Into<String>,
        step_category: StepCategory,
    ) -> Self {
        let now = Utc::now();
        let identifier = identifier.into();
        Self {
            id: Uuid::now_v7(),
            plan_execution_id: ambiance.plan_execution_id,
            node_id: node_id.into(),
            name: identifier.clone(),
            identifier,
            step_category,
            status: Status::Queued,
            created_at: now,
            last_updated_at: now,
            ambiance,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_step_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = step_type.into();
        self
    }

    pub fn with_stage_fqn(mut self, stage_fqn: impl Into<String>) -> Self {
        self.stage_fqn = Some(stage_fqn.into());
        self
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// Callback ids this node is currently waiting on.
    pub fn pending_callback_ids(&self) -> Vec<String> {
        self.executable_responses
            .iter()
            .flat_map(|r| match r {
                ExecutableResponse::Async { callback_ids } => callback_ids.clone(),
                ExecutableResponse::Task { task_id } => vec![task_id.clone()],
                _ => Vec::new(),
            })
            .collect()
    }
}

/// A stage (or stage-level strategy) that a failed pipeline can resume from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryableStageInfo {
    pub node_execution_id: Uuid,
    pub identifier: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_fqn: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub is_strategy: bool,
}
