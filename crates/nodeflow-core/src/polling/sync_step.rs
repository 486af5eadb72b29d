//! GitOps-style sync step.
//!
//! Eligibility pass, one sync request per eligible item, then the polling
//! loop. The step dispatches asynchronously: the reconciliation runs in a
//! background task and reports its outcome through the completion sink.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use nodeflow_types::callback::{DispatchResult, ResultPayload, StepSpec};
use nodeflow_types::config::PollingConfig;
use nodeflow_types::error::{EngineError, ValidationError};
use nodeflow_types::execution::{NodeExecution, Status};
use nodeflow_types::sync::{ItemReport, SyncItem, SyncScope, SyncStepOutcome};

use super::eligibility::partition_eligible;
use super::poll_loop::PollingLoop;
use super::remote::RemoteResourceApi;
use super::retry::RetryPolicy;
use crate::callback::handler::StepHandler;
use crate::callback::sink::{Completion, CompletionSender};

pub const SYNC_STEP_TYPE: &str = "GitOpsSync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStepParameters {
    pub scope: SyncScope,
    pub items: Vec<SyncItem>,
    /// Step timeout. The polling deadline is this minus the safety margin.
    pub timeout_secs: u64,
}

impl SyncStepParameters {
    pub fn parse(value: &serde_json::Value) -> Result<Self, ValidationError> {
        let params: Self = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::InvalidStepSpec(format!("sync parameters: {e}")))?;
        if params.timeout_secs == 0 {
            return Err(ValidationError::InvalidStepSpec(
                "sync parameters: timeout_secs must be positive".into(),
            ));
        }
        if params.items.is_empty() {
            return Err(ValidationError::InvalidStepSpec(
                "sync parameters: no items to sync".into(),
            ));
        }
        Ok(params)
    }
}

/// Runs one sync step to completion.
pub struct SyncReconciler<A: RemoteResourceApi> {
    api: Arc<A>,
    config: PollingConfig,
}

impl<A: RemoteResourceApi> SyncReconciler<A> {
    pub fn new(api: Arc<A>, config: PollingConfig) -> Self {
        Self { api, config }
    }

    pub async fn run(&self, params: &SyncStepParameters, cancel: &CancellationToken) -> SyncStepOutcome {
        let started_at = Utc::now();
        let budget = Duration::from_secs(params.timeout_secs).saturating_sub(self.config.safety_margin());
        let deadline = Instant::now() + budget;
        let retry = RetryPolicy::from_config(&self.config);

        let (eligible, mut failed) = partition_eligible(&params.items, &params.scope);
        let mut syncing = Vec::with_capacity(eligible.len());
        let mut unsent = Vec::new();
        for item in eligible {
            if cancel.is_cancelled() {
                unsent.push(ItemReport::for_item(&item).with_message("sync request not sent: cancelled"));
                continue;
            }
            let api = &*self.api;
            let target = &item;
            let requested = tokio::select! {
                _ = cancel.cancelled() => None,
                requested = tokio::time::timeout_at(deadline, retry.run("sync", move || api.sync(target))) => Some(requested),
            };
            match requested {
                Some(Ok(Ok(()))) => syncing.push(item),
                Some(Ok(Err(e))) => {
                    warn!(item = %item.name, error = %e, "sync request failed");
                    failed.push(ItemReport::for_item(&item).with_message(format!("sync request failed: {e}")));
                }
                Some(Err(_)) => {
                    warn!(item = %item.name, "sync request timed out");
                    failed.push(ItemReport::for_item(&item).with_message("sync request timed out"));
                }
                None => {
                    unsent.push(ItemReport::for_item(&item).with_message("sync request not sent: cancelled"));
                }
            }
        }

        let polling = PollingLoop::new(self.api.clone(), self.config.interval(), retry);
        let mut buckets = polling.run(syncing, started_at, deadline, cancel).await;
        failed.append(&mut buckets.failed);
        buckets.failed = failed;
        buckets.still_running.append(&mut unsent);

        let outcome = SyncStepOutcome::from_buckets(buckets);
        info!(status = ?outcome.status, summary = %outcome.summary, "sync step finished");
        outcome
    }
}

/// Terminal payload reported for a finished sync step.
pub fn completion_payload(outcome: &SyncStepOutcome) -> ResultPayload {
    if outcome.status == Status::Succeeded {
        return ResultPayload::success(serde_json::to_value(outcome).unwrap_or_default());
    }
    let mut reason = outcome.summary.clone();
    for report in &outcome.buckets.failed {
        reason.push_str(&format!("; {}: {}", report.name, report.message));
    }
    if !outcome.buckets.still_running.is_empty() {
        let names: Vec<&str> = outcome
            .buckets
            .still_running
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        reason.push_str(&format!("; still running: {}", names.join(", ")));
    }
    ResultPayload::Failure {
        reason,
        irrecoverable: false,
    }
}

/// Step handler wrapping `SyncReconciler`.
pub struct SyncStep<A: RemoteResourceApi + 'static> {
    reconciler: Arc<SyncReconciler<A>>,
    completions: CompletionSender,
    /// Cancellation tokens of running reconciliations keyed by node id.
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<A: RemoteResourceApi + 'static> SyncStep<A> {
    pub fn new(api: Arc<A>, config: PollingConfig, completions: CompletionSender) -> Self {
        Self {
            reconciler: Arc::new(SyncReconciler::new(api, config)),
            completions,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn callback_id(node_execution_id: Uuid) -> String {
        format!("sync-{node_execution_id}")
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

impl<A: RemoteResourceApi + 'static> StepHandler for SyncStep<A> {
    fn step_type(&self) -> &str {
        SYNC_STEP_TYPE
    }

    fn validate(&self, spec: &StepSpec) -> Result<(), ValidationError> {
        SyncStepParameters::parse(&spec.parameters).map(|_| ())
    }

    async fn dispatch(&self, node: &NodeExecution, _spec: &StepSpec) -> Result<DispatchResult, EngineError> {
        Ok(DispatchResult::Pending {
            callback_ids: vec![Self::callback_id(node.id)],
        })
    }

    fn on_waiting(&self, node: &NodeExecution, callback_ids: &[String]) {
        let Some(callback_id) = callback_ids.first().cloned() else {
            return;
        };
        let params = match node
            .resolved_parameters
            .as_ref()
            .ok_or_else(|| ValidationError::InvalidStepSpec("sync parameters missing".into()))
            .and_then(SyncStepParameters::parse)
        {
            Ok(params) => params,
            Err(e) => {
                warn!(node_execution_id = %node.id, error = %e, "sync parameters unreadable");
                let payload = ResultPayload::failure(e.to_string());
                if self.completions.send(Completion { callback_id, payload }).is_err() {
                    warn!(node_execution_id = %node.id, "completion sink closed, sync failure dropped");
                }
                return;
            }
        };

        let cancel = CancellationToken::new();
        self.running.insert(node.id, cancel.clone());
        let reconciler = self.reconciler.clone();
        let running = self.running.clone();
        let completions = self.completions.clone();
        let node_execution_id = node.id;
        tokio::spawn(async move {
            let outcome = reconciler.run(&params, &cancel).await;
            running.remove(&node_execution_id);
            let payload = completion_payload(&outcome);
            if completions.send(Completion { callback_id, payload }).is_err() {
                warn!(node_execution_id = %node_execution_id, "completion sink closed, sync outcome dropped");
            }
        });
    }

    async fn abort(&self, node: &NodeExecution) -> Result<(), EngineError> {
        if let Some((_, cancel)) = self.running.remove(&node.id) {
            info!(node_execution_id = %node.id, "cancelling sync reconciliation");
            cancel.cancel();
        }
        Ok(())
    }
}
