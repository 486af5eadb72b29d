//! Async callback protocol payloads.
//!
//! A dispatched step either completes inline or hands back one or more
//! callback ids. Each id is persisted as a `CallbackWait` until the external
//! executor delivers a `ResultPayload` through the notify sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::Status;

/// Typed result delivered by an external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultPayload {
    Success {
        #[serde(default)]
        outcome: serde_json::Value,
    },
    Failure {
        reason: String,
        /// The executor itself faulted (as opposed to the step failing).
        #[serde(default)]
        irrecoverable: bool,
    },
    Skipped {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Still in progress. Recorded, never resolves the wait.
    Pending {
        #[serde(default)]
        progress: serde_json::Value,
    },
}

impl ResultPayload {
    pub fn success(outcome: serde_json::Value) -> Self {
        ResultPayload::Success { outcome }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        ResultPayload::Failure {
            reason: reason.into(),
            irrecoverable: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultPayload::Pending { .. })
    }
}

/// A step as handed to a step handler: its type tag plus raw parameters,
/// which the handler decodes into its own typed struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_type: String,
    pub identifier: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl StepSpec {
    pub fn new(step_type: impl Into<String>, identifier: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            step_type: step_type.into(),
            identifier: identifier.into(),
            parameters,
        }
    }
}

/// What a step handler's dispatch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    /// Completed inline.
    Sync(ResultPayload),
    /// Work handed to an external executor; resolved later by callback id.
    Pending { callback_ids: Vec<String> },
}

/// Persisted mapping of one callback id to the node awaiting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackWait {
    pub callback_id: String,
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Last non-terminal progress report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    /// Terminal payload, set exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CallbackWait {
    pub fn new(callback_id: impl Into<String>, node_execution_id: Uuid, plan_execution_id: Uuid) -> Self {
        Self {
            callback_id: callback_id.into(),
            node_execution_id,
            plan_execution_id,
            created_at: Utc::now(),
            progress: None,
            result: None,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

/// What `Notify`/`Resolve` did with a delivered payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// The wait was already resolved; the delivery was ignored.
    Duplicate,
    /// Progress was recorded; the node keeps waiting.
    Progress,
    /// Resolved, but sibling callback ids of the node are still outstanding.
    AwaitingSiblings { remaining: usize },
    /// Every id resolved; the node moved to `status`.
    Transitioned { status: Status },
    /// Every id resolved but the node was no longer in a resolvable status.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_wire_form() {
        let payload: ResultPayload =
            serde_json::from_str(r#"{"type":"failure","reason":"boom"}"#).unwrap();
        assert_eq!(payload, ResultPayload::failure("boom"));

        let payload: ResultPayload = serde_json::from_str(r#"{"type":"pending"}"#).unwrap();
        assert!(!payload.is_terminal());

        let json = serde_json::to_value(ResultPayload::success(serde_json::json!({"ok": 1}))).unwrap();
        assert_eq!(json["type"], "success");
        assert_eq!(json["outcome"]["ok"], 1);
    }

    #[test]
    fn new_wait_is_unresolved() {
        let wait = CallbackWait::new("cb-1", Uuid::now_v7(), Uuid::now_v7());
        assert!(!wait.is_resolved());
        assert!(wait.progress.is_none());
    }
}
