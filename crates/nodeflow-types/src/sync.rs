//! Types for the polling-based sync step.
//!
//! A sync step asks a remote reconciler (a GitOps controller, for example) to
//! sync a set of managed items, then polls until each item reaches a terminal
//! operation phase or the step deadline runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::Status;

/// Scope selected for the current run. Items outside it are not synced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncScope {
    pub service: String,
    pub environment: String,
    pub cluster: String,
}

/// One remotely-managed item to sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub name: String,
    /// Reconciler-side identity used for remote calls.
    pub agent: String,
    pub service: String,
    pub environment: String,
    pub cluster: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub managed_resources: Vec<String>,
}

/// Remote sync state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

/// Phase of the most recent sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    #[default]
    Running,
    Terminating,
    Succeeded,
    Failed,
    Error,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationPhase::Succeeded | OperationPhase::Failed | OperationPhase::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    #[default]
    Unknown,
}

/// Snapshot returned by the remote status API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub sync_state: SyncState,
    pub phase: OperationPhase,
    #[serde(default)]
    pub message: String,
    pub health: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation_started_at: Option<DateTime<Utc>>,
}

/// Per-item report carried in the final buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    pub name: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<SyncState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<OperationPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub message: String,
}

impl ItemReport {
    pub fn for_item(item: &SyncItem) -> Self {
        Self {
            name: item.name.clone(),
            agent: item.agent.clone(),
            sync_state: None,
            phase: None,
            health: None,
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn record(&mut self, status: &RemoteStatus) {
        self.sync_state = Some(status.sync_state);
        self.phase = Some(status.phase);
        self.health = Some(status.health);
        self.message = status.message.clone();
    }
}

/// Three disjoint result buckets of a batch sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBuckets {
    pub succeeded: Vec<ItemReport>,
    pub failed: Vec<ItemReport>,
    pub still_running: Vec<ItemReport>,
}

impl SyncBuckets {
    /// FAILED if anything failed or is still running, even when most succeeded.
    pub fn overall_status(&self) -> Status {
        if self.failed.is_empty() && self.still_running.is_empty() {
            Status::Succeeded
        } else {
            Status::Failed
        }
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.still_running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a whole sync step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStepOutcome {
    pub status: Status,
    pub buckets: SyncBuckets,
    pub summary: String,
}

impl SyncStepOutcome {
    pub fn from_buckets(buckets: SyncBuckets) -> Self {
        let summary = format!(
            "{} succeeded, {} failed, {} still running",
            buckets.succeeded.len(),
            buckets.failed.len(),
            buckets.still_running.len()
        );
        Self {
            status: buckets.overall_status(),
            buckets,
            summary,
        }
    }
}
