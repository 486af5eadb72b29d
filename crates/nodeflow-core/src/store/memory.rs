//! In-memory repository implementations backed by `DashMap`.
//!
//! Each record lives in its own map entry, so a conditional write holds only
//! that entry's shard lock while it checks and mutates. Used by tests and by
//! embedders that do not need durability.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use nodeflow_types::callback::{CallbackWait, ResultPayload};
use nodeflow_types::error::RepositoryError;
use nodeflow_types::execution::{NodeExecution, Status};
use nodeflow_types::query::{NodeFilter, NodeUpdate, Projection};

use crate::repository::callback::CallbackRepository;
use crate::repository::node_execution::{NodeExecutionRepository, StatusChange};

/// Node execution records keyed by id. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNodeExecutionRepository {
    nodes: Arc<DashMap<Uuid, NodeExecution>>,
}

impl InMemoryNodeExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeExecutionRepository for InMemoryNodeExecutionRepository {
    async fn insert(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        match self.nodes.entry(node.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "node execution {} already exists",
                node.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(node.clone());
                Ok(())
            }
        }
    }

    async fn insert_all(&self, nodes: &[NodeExecution]) -> Result<(), RepositoryError> {
        if let Some(dup) = nodes.iter().find(|n| self.nodes.contains_key(&n.id)) {
            return Err(RepositoryError::Conflict(format!(
                "node execution {} already exists",
                dup.id
            )));
        }
        for node in nodes {
            self.nodes.insert(node.id, node.clone());
        }
        Ok(())
    }

    async fn get(
        &self,
        id: Uuid,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self.nodes.get(&id).map(|n| projection.apply(&n)))
    }

    async fn find(
        &self,
        filter: &NodeFilter,
        projection: &Projection,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let mut matched: Vec<NodeExecution> = self
            .nodes
            .iter()
            .filter(|n| filter.matches(n.value()))
            .map(|n| n.value().clone())
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matched.iter().map(|n| projection.apply(n)).collect())
    }

    async fn count(&self, filter: &NodeFilter) -> Result<u64, RepositoryError> {
        Ok(self.nodes.iter().filter(|n| filter.matches(n.value())).count() as u64)
    }

    async fn replace(&self, node: &NodeExecution) -> Result<NodeExecution, RepositoryError> {
        let mut entry = self.nodes.get_mut(&node.id).ok_or(RepositoryError::NotFound)?;
        if entry.version != node.version {
            return Err(RepositoryError::Conflict(format!(
                "node execution {} version {} is stale (stored {})",
                node.id, node.version, entry.version
            )));
        }
        let mut saved = node.clone();
        saved.version += 1;
        saved.status = entry.status;
        saved.end_ts = entry.end_ts;
        *entry = saved.clone();
        Ok(saved)
    }

    async fn update_fields(
        &self,
        id: Uuid,
        update: &NodeUpdate,
        now: DateTime<Utc>,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        Ok(self.nodes.get_mut(&id).map(|mut entry| {
            update.apply(&mut entry);
            entry.last_updated_at = now;
            projection.apply(&entry)
        }))
    }

    async fn update_many(
        &self,
        filter: &NodeFilter,
        update: &NodeUpdate,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut changed = 0;
        for mut entry in self.nodes.iter_mut() {
            if filter.matches(entry.value()) {
                update.apply(entry.value_mut());
                entry.last_updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn transition(
        &self,
        id: Uuid,
        allowed: &[Status],
        change: &StatusChange,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let Some(mut entry) = self.nodes.get_mut(&id) else {
            return Ok(None);
        };
        if !allowed.contains(&entry.status) {
            return Ok(None);
        }
        change.apply(&mut entry);
        Ok(Some(projection.apply(&entry)))
    }

    async fn transition_many(
        &self,
        filter: &NodeFilter,
        change: &StatusChange,
    ) -> Result<u64, RepositoryError> {
        let mut changed = 0;
        for mut entry in self.nodes.iter_mut() {
            if filter.matches(entry.value()) {
                change.apply(entry.value_mut());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_ids(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        Ok(ids.iter().filter(|id| self.nodes.remove(*id).is_some()).count() as u64)
    }

    async fn distinct_statuses(&self, filter: &NodeFilter) -> Result<Vec<Status>, RepositoryError> {
        let statuses: BTreeSet<Status> = self
            .nodes
            .iter()
            .filter(|n| filter.matches(n.value()))
            .map(|n| n.status)
            .collect();
        Ok(statuses.into_iter().collect())
    }

    async fn count_by_account(
        &self,
        filter: &NodeFilter,
    ) -> Result<Vec<(String, u64)>, RepositoryError> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for node in self.nodes.iter().filter(|n| filter.matches(n.value())) {
            *counts.entry(node.ambiance.account_id.clone()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

/// Callback waits keyed by callback id. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCallbackRepository {
    waits: Arc<DashMap<String, CallbackWait>>,
}

impl InMemoryCallbackRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CallbackRepository for InMemoryCallbackRepository {
    async fn register(&self, waits: &[CallbackWait]) -> Result<(), RepositoryError> {
        // All or nothing: a conflict removes the waits this call inserted.
        let mut inserted: Vec<&str> = Vec::with_capacity(waits.len());
        for wait in waits {
            let conflict = match self.waits.entry(wait.callback_id.clone()) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(wait.clone());
                    false
                }
            };
            if conflict {
                // The entry guard is released before touching other shards.
                for id in inserted {
                    self.waits.remove(id);
                }
                return Err(RepositoryError::Conflict(format!(
                    "callback '{}' already registered",
                    wait.callback_id
                )));
            }
            inserted.push(&wait.callback_id);
        }
        Ok(())
    }

    async fn get(&self, callback_id: &str) -> Result<Option<CallbackWait>, RepositoryError> {
        Ok(self.waits.get(callback_id).map(|w| w.clone()))
    }

    async fn list_for_node(
        &self,
        node_execution_id: Uuid,
    ) -> Result<Vec<CallbackWait>, RepositoryError> {
        let mut waits: Vec<CallbackWait> = self
            .waits
            .iter()
            .filter(|w| w.node_execution_id == node_execution_id)
            .map(|w| w.clone())
            .collect();
        waits.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(waits)
    }

    async fn resolve_once(
        &self,
        callback_id: &str,
        result: &ResultPayload,
        now: DateTime<Utc>,
    ) -> Result<Option<CallbackWait>, RepositoryError> {
        let Some(mut wait) = self.waits.get_mut(callback_id) else {
            return Ok(None);
        };
        if wait.result.is_some() {
            return Ok(None);
        }
        wait.result = Some(result.clone());
        wait.resolved_at = Some(now);
        Ok(Some(wait.clone()))
    }

    async fn record_progress(
        &self,
        callback_id: &str,
        progress: &serde_json::Value,
    ) -> Result<bool, RepositoryError> {
        let Some(mut wait) = self.waits.get_mut(callback_id) else {
            return Ok(false);
        };
        if wait.result.is_some() {
            return Ok(false);
        }
        wait.progress = Some(progress.clone());
        Ok(true)
    }

    async fn delete_for_plan(&self, plan_execution_id: Uuid) -> Result<u64, RepositoryError> {
        let before = self.waits.len();
        self.waits.retain(|_, w| w.plan_execution_id != plan_execution_id);
        Ok((before - self.waits.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_types::execution::{Ambiance, StepCategory};

    fn node(status: Status) -> NodeExecution {
        NodeExecution::new(Ambiance::new("acct", Uuid::now_v7()), "n", "step", StepCategory::Step)
            .with_status(status)
    }

    #[tokio::test]
    async fn insert_twice_conflicts() {
        let repo = InMemoryNodeExecutionRepository::new();
        let n = node(Status::Queued);
        repo.insert(&n).await.unwrap();
        assert!(matches!(repo.insert(&n).await, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn transition_requires_allowed_status() {
        let repo = InMemoryNodeExecutionRepository::new();
        let n = node(Status::Queued);
        repo.insert(&n).await.unwrap();
        let change = StatusChange::new(Status::Succeeded, NodeUpdate::new());

        let missed = repo
            .transition(n.id, &[Status::Running], &change, &Projection::ids_only())
            .await
            .unwrap();
        assert!(missed.is_none());

        let hit = repo
            .transition(n.id, &[Status::Queued], &change, &Projection::all())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.status, Status::Succeeded);
        assert!(hit.end_ts.is_some());
    }

    #[tokio::test]
    async fn replace_checks_version() {
        let repo = InMemoryNodeExecutionRepository::new();
        let n = node(Status::Running);
        repo.insert(&n).await.unwrap();

        let saved = repo.replace(&n).await.unwrap();
        assert_eq!(saved.version, 1);
        assert!(matches!(repo.replace(&n).await, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn replace_never_moves_status() {
        let repo = InMemoryNodeExecutionRepository::new();
        let n = node(Status::Running);
        repo.insert(&n).await.unwrap();
        let finished = StatusChange::new(Status::Succeeded, NodeUpdate::new());
        repo.transition(n.id, &[Status::Running], &finished, &Projection::all())
            .await
            .unwrap()
            .unwrap();

        let mut edited = repo.get(n.id, &Projection::all()).await.unwrap().unwrap();
        edited.status = Status::Running;
        edited.end_ts = None;
        edited.name = "renamed".into();
        let saved = repo.replace(&edited).await.unwrap();
        assert_eq!(saved.status, Status::Succeeded);
        assert!(saved.end_ts.is_some());
        assert_eq!(saved.name, "renamed");

        let reopen = StatusChange::new(Status::Failed, NodeUpdate::new());
        assert!(repo
            .transition(n.id, &[Status::Running], &reopen, &Projection::all())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_conflict_and_atomic() {
        let repo = InMemoryCallbackRepository::new();
        let node = Uuid::now_v7();
        let plan = Uuid::now_v7();
        repo.register(&[CallbackWait::new("cb-1", node, plan)]).await.unwrap();

        let err = repo
            .register(&[
                CallbackWait::new("cb-2", node, plan),
                CallbackWait::new("cb-1", node, plan),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.get("cb-2").await.unwrap().is_none());
        assert!(repo.get("cb-1").await.unwrap().is_some());

        let err = repo
            .register(&[
                CallbackWait::new("cb-3", node, plan),
                CallbackWait::new("cb-3", node, plan),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.get("cb-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_once_only_once() {
        let repo = InMemoryCallbackRepository::new();
        let wait = CallbackWait::new("cb", Uuid::now_v7(), Uuid::now_v7());
        repo.register(std::slice::from_ref(&wait)).await.unwrap();

        let payload = ResultPayload::success(serde_json::json!({}));
        assert!(repo.resolve_once("cb", &payload, Utc::now()).await.unwrap().is_some());
        assert!(repo.resolve_once("cb", &payload, Utc::now()).await.unwrap().is_none());
        assert!(!repo.record_progress("cb", &serde_json::json!(1)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_for_plan_only_touches_that_plan() {
        let repo = InMemoryCallbackRepository::new();
        let plan = Uuid::now_v7();
        repo.register(&[
            CallbackWait::new("a", Uuid::now_v7(), plan),
            CallbackWait::new("b", Uuid::now_v7(), plan),
            CallbackWait::new("c", Uuid::now_v7(), Uuid::now_v7()),
        ])
        .await
        .unwrap();
        assert_eq!(repo.delete_for_plan(plan).await.unwrap(), 2);
        assert!(repo.get("c").await.unwrap().is_some());
    }
}
