//! Validating wrapper around a `NodeExecutionRepository`.
//!
//! Every read and bulk write passes through here so that empty projections
//! and oversized `IN` lists are rejected before any I/O happens.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use nodeflow_types::error::EngineError;
use nodeflow_types::execution::{NodeExecution, Status};
use nodeflow_types::query::{
    Criterion, MAX_BATCH_SIZE, NodeField, NodeFilter, NodeUpdate, Projection,
};

use crate::execution::observer::ObserverRegistry;
use crate::repository::node_execution::{NodeExecutionRepository, StatusChange};

/// Execution store: the single source of truth for node execution records.
pub struct NodeExecutionStore<R: NodeExecutionRepository> {
    repo: R,
    max_batch_size: usize,
    observers: Arc<ObserverRegistry>,
}

impl<R: NodeExecutionRepository> NodeExecutionStore<R> {
    pub fn new(repo: R, observers: Arc<ObserverRegistry>) -> Self {
        Self {
            repo,
            max_batch_size: MAX_BATCH_SIZE,
            observers,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn check(&self, filter: &NodeFilter) -> Result<(), EngineError> {
        filter.validate(self.max_batch_size)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub async fn insert(&self, node: &NodeExecution) -> Result<(), EngineError> {
        self.repo.insert(node).await?;
        debug!(node_execution_id = %node.id, status = ?node.status, "node execution inserted");
        Ok(())
    }

    pub async fn insert_all(&self, nodes: &[NodeExecution]) -> Result<(), EngineError> {
        if nodes.is_empty() {
            return Ok(());
        }
        self.repo.insert_all(nodes).await?;
        debug!(count = nodes.len(), "node executions inserted");
        Ok(())
    }

    /// Full-document save guarded by the record's version token. Never
    /// changes the status.
    pub async fn replace(&self, node: &NodeExecution) -> Result<NodeExecution, EngineError> {
        Ok(self.repo.replace(node).await?)
    }

    /// Field-scoped update of one record; always stamps `last_updated_at`.
    pub async fn update_fields(
        &self,
        id: Uuid,
        update: &NodeUpdate,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, EngineError> {
        projection.validate()?;
        let updated = self
            .repo
            .update_fields(id, update, Utc::now(), projection)
            .await?;
        if update.should_log() {
            info!(node_execution_id = %id, ops = update.ops.len(), "node execution fields updated");
        } else {
            debug!(node_execution_id = %id, ops = update.ops.len(), "node execution fields updated");
        }
        Ok(updated)
    }

    pub async fn update_many(
        &self,
        filter: &NodeFilter,
        update: &NodeUpdate,
    ) -> Result<u64, EngineError> {
        self.check(filter)?;
        Ok(self.repo.update_many(filter, update, Utc::now()).await?)
    }

    /// Conditional status write. `None` means nothing matched.
    pub async fn transition(
        &self,
        id: Uuid,
        allowed: &[Status],
        change: &StatusChange,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, EngineError> {
        projection.validate()?;
        Ok(self.repo.transition(id, allowed, change, projection).await?)
    }

    pub async fn transition_many(
        &self,
        filter: &NodeFilter,
        change: &StatusChange,
    ) -> Result<u64, EngineError> {
        self.check(filter)?;
        Ok(self.repo.transition_many(filter, change).await?)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(
        &self,
        id: Uuid,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, EngineError> {
        projection.validate()?;
        Ok(self.repo.get(id, projection).await?)
    }

    /// Like `get`, but a missing record is `NodeNotFound`.
    pub async fn get_required(
        &self,
        id: Uuid,
        projection: &Projection,
    ) -> Result<NodeExecution, EngineError> {
        self.get(id, projection)
            .await?
            .ok_or(EngineError::NodeNotFound(id))
    }

    pub async fn find(
        &self,
        filter: &NodeFilter,
        projection: &Projection,
    ) -> Result<Vec<NodeExecution>, EngineError> {
        projection.validate()?;
        self.check(filter)?;
        Ok(self.repo.find(filter, projection).await?)
    }

    /// Read `ids` in chunks of the batch size.
    pub async fn find_by_ids(
        &self,
        ids: &[Uuid],
        projection: &Projection,
    ) -> Result<Vec<NodeExecution>, EngineError> {
        projection.validate()?;
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_batch_size) {
            let filter = NodeFilter::new().ids(chunk.to_vec());
            found.extend(self.repo.find(&filter, projection).await?);
        }
        Ok(found)
    }

    pub async fn count(&self, filter: &NodeFilter) -> Result<u64, EngineError> {
        self.check(filter)?;
        Ok(self.repo.count(filter).await?)
    }

    /// Current children of `parent_id`, optionally restricted to `statuses`.
    pub async fn count_by_parent_and_status_in(
        &self,
        parent_id: Uuid,
        statuses: &[Status],
    ) -> Result<u64, EngineError> {
        let mut filter = NodeFilter::new()
            .and(Criterion::ParentId(parent_id))
            .current();
        if !statuses.is_empty() {
            filter = filter.status_in(statuses.iter().copied());
        }
        self.count(&filter).await
    }

    /// Statuses present in the run that are neither flowing nor terminal.
    pub async fn non_flowing_non_final_statuses(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<Status>, EngineError> {
        let excluded: Vec<Status> = Status::ALL
            .into_iter()
            .filter(|s| s.is_flowing() || s.is_final())
            .collect();
        let filter = NodeFilter::plan(plan_execution_id)
            .current()
            .and(Criterion::StatusNotIn(excluded));
        let mut statuses: Vec<Status> = self
            .repo
            .distinct_statuses(&filter)
            .await?
            .into_iter()
            .filter(|s| !s.is_flowing() && !s.is_final())
            .collect();
        statuses.sort_unstable();
        statuses.dedup();
        Ok(statuses)
    }

    /// Current non-terminal records grouped by account.
    pub async fn running_count_per_account(&self) -> Result<Vec<(String, u64)>, EngineError> {
        let filter = NodeFilter::new().current().status_in(Status::active());
        Ok(self.repo.count_by_account(&filter).await?)
    }

    /// Timeout registrations of a record. A SKIPPED record never has any.
    pub async fn timeout_instance_ids(
        &self,
        status: Status,
        id: Uuid,
    ) -> Result<Vec<String>, EngineError> {
        if status == Status::Skipped {
            return Ok(Vec::new());
        }
        let projection = Projection::of(&[NodeField::TimeoutInstanceIds]);
        Ok(self
            .get(id, &projection)
            .await?
            .map(|n| n.timeout_instance_ids)
            .unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    /// Delete every record of a run, old retries included, in batches.
    /// Delete observers fire once per batch. Returns the number deleted.
    pub async fn purge_plan_execution(&self, plan_execution_id: Uuid) -> Result<u64, EngineError> {
        let ids: Vec<Uuid> = self
            .repo
            .find(&NodeFilter::plan(plan_execution_id), &Projection::ids_only())
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect();

        let mut deleted = 0;
        for batch in ids.chunks(self.max_batch_size) {
            deleted += self.repo.delete_ids(batch).await?;
            self.observers.notify_nodes_deleted(plan_execution_id, batch);
        }
        info!(plan_execution_id = %plan_execution_id, deleted, "plan execution purged");
        Ok(deleted)
    }
}
