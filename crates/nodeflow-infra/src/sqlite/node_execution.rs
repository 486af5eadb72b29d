//! SQLite node execution repository implementation.
//!
//! Implements `NodeExecutionRepository` from `nodeflow-core`. Scalar fields
//! get their own columns; nested structures (ambiance, responses, interrupt
//! trail, outcome) are stored as JSON text. Conditional status transitions
//! are a single `UPDATE .. WHERE status IN (..) RETURNING ..` on the writer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use nodeflow_core::repository::node_execution::{NodeExecutionRepository, StatusChange};
use nodeflow_types::error::RepositoryError;
use nodeflow_types::execution::{NodeExecution, Status};
use nodeflow_types::query::{NodeFilter, NodeUpdate, Projection};

use super::pool::DatabasePool;
use super::query::{
    decode_node, format_datetime, push_filter, push_ids, push_set_clause, push_status_change,
    select_columns, to_json,
};

/// Persisted columns, in bind order.
const COLUMNS: [&str; 27] = [
    "id",
    "plan_execution_id",
    "account_id",
    "node_id",
    "parent_id",
    "previous_id",
    "next_id",
    "stage_fqn",
    "identifier",
    "name",
    "step_type",
    "step_category",
    "mode",
    "status",
    "old_retry",
    "created_at",
    "last_updated_at",
    "start_ts",
    "end_ts",
    "timeout_instance_ids",
    "resolved_parameters",
    "executable_responses",
    "outcome",
    "failure_info",
    "interrupt_histories",
    "ambiance",
    "version",
];

/// SQLite-backed implementation of `NodeExecutionRepository`.
pub struct SqliteNodeExecutionRepository {
    pool: DatabasePool,
}

impl SqliteNodeExecutionRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

/// A record encoded into column values.
struct NodeRow {
    id: String,
    plan_execution_id: String,
    account_id: String,
    node_id: String,
    parent_id: Option<String>,
    previous_id: Option<String>,
    next_id: Option<String>,
    stage_fqn: Option<String>,
    identifier: String,
    name: String,
    step_type: String,
    step_category: &'static str,
    mode: Option<&'static str>,
    status: &'static str,
    old_retry: bool,
    created_at: String,
    last_updated_at: String,
    start_ts: Option<String>,
    end_ts: Option<String>,
    timeout_instance_ids: String,
    resolved_parameters: Option<String>,
    executable_responses: String,
    outcome: Option<String>,
    failure_info: Option<String>,
    interrupt_histories: String,
    ambiance: String,
    version: i64,
}

impl NodeRow {
    fn from_domain(node: &NodeExecution) -> Result<Self, RepositoryError> {
        Ok(Self {
            id: node.id.to_string(),
            plan_execution_id: node.plan_execution_id.to_string(),
            account_id: node.ambiance.account_id.clone(),
            node_id: node.node_id.clone(),
            parent_id: node.parent_id.map(|id| id.to_string()),
            previous_id: node.previous_id.map(|id| id.to_string()),
            next_id: node.next_id.map(|id| id.to_string()),
            stage_fqn: node.stage_fqn.clone(),
            identifier: node.identifier.clone(),
            name: node.name.clone(),
            step_type: node.step_type.clone(),
            step_category: node.step_category.as_str(),
            mode: node.mode.map(|m| m.as_str()),
            status: node.status.as_str(),
            old_retry: node.old_retry,
            created_at: format_datetime(&node.created_at),
            last_updated_at: format_datetime(&node.last_updated_at),
            start_ts: node.start_ts.as_ref().map(format_datetime),
            end_ts: node.end_ts.as_ref().map(format_datetime),
            timeout_instance_ids: to_json(&node.timeout_instance_ids)?,
            resolved_parameters: node.resolved_parameters.as_ref().map(to_json).transpose()?,
            executable_responses: to_json(&node.executable_responses)?,
            outcome: node.outcome.as_ref().map(to_json).transpose()?,
            failure_info: node.failure_info.as_ref().map(to_json).transpose()?,
            interrupt_histories: to_json(&node.interrupt_histories)?,
            ambiance: to_json(&node.ambiance)?,
            version: node.version,
        })
    }

    /// Bind every column in `COLUMNS` order.
    fn bind<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        self.bind_where(query, |_| true)
    }

    /// Bind the columns accepted by `keep`, in `COLUMNS` order.
    fn bind_where<'q>(
        self,
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
        keep: impl Fn(&str) -> bool,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        macro_rules! bind {
            ($column:literal, $value:expr) => {
                if keep($column) {
                    query = query.bind($value);
                }
            };
        }
        bind!("id", self.id);
        bind!("plan_execution_id", self.plan_execution_id);
        bind!("account_id", self.account_id);
        bind!("node_id", self.node_id);
        bind!("parent_id", self.parent_id);
        bind!("previous_id", self.previous_id);
        bind!("next_id", self.next_id);
        bind!("stage_fqn", self.stage_fqn);
        bind!("identifier", self.identifier);
        bind!("name", self.name);
        bind!("step_type", self.step_type);
        bind!("step_category", self.step_category);
        bind!("mode", self.mode);
        bind!("status", self.status);
        bind!("old_retry", self.old_retry);
        bind!("created_at", self.created_at);
        bind!("last_updated_at", self.last_updated_at);
        bind!("start_ts", self.start_ts);
        bind!("end_ts", self.end_ts);
        bind!("timeout_instance_ids", self.timeout_instance_ids);
        bind!("resolved_parameters", self.resolved_parameters);
        bind!("executable_responses", self.executable_responses);
        bind!("outcome", self.outcome);
        bind!("failure_info", self.failure_info);
        bind!("interrupt_histories", self.interrupt_histories);
        bind!("ambiance", self.ambiance);
        bind!("version", self.version);
        query
    }
}

fn insert_sql() -> String {
    format!(
        "INSERT INTO node_executions ({}) VALUES ({})",
        COLUMNS.join(", "),
        vec!["?"; COLUMNS.len()].join(", ")
    )
}

/// Columns a full-document save never writes; they only move through
/// conditional status transitions.
const TRANSITION_ONLY: [&str; 2] = ["status", "end_ts"];

fn replaced_column(column: &str) -> bool {
    !TRANSITION_ONLY.contains(&column)
}

fn replace_sql() -> String {
    let assignments = COLUMNS
        .iter()
        .filter(|c| replaced_column(c))
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE node_executions SET {assignments} WHERE id = ? AND version = ? RETURNING {}",
        select_columns(&Projection::all())
    )
}

fn map_insert_error(e: sqlx::Error, id: Uuid) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return RepositoryError::Conflict(format!("node execution {id} already exists"));
        }
    }
    RepositoryError::Query(e.to_string())
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// NodeExecutionRepository implementation
// ---------------------------------------------------------------------------

impl NodeExecutionRepository for SqliteNodeExecutionRepository {
    async fn insert(&self, node: &NodeExecution) -> Result<(), RepositoryError> {
        let sql = insert_sql();
        NodeRow::from_domain(node)?
            .bind(sqlx::query(&sql))
            .execute(&self.pool.writer)
            .await
            .map_err(|e| map_insert_error(e, node.id))?;
        Ok(())
    }

    async fn insert_all(&self, nodes: &[NodeExecution]) -> Result<(), RepositoryError> {
        if nodes.is_empty() {
            return Ok(());
        }
        let sql = insert_sql();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        for node in nodes {
            NodeRow::from_domain(node)?
                .bind(sqlx::query(&sql))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_insert_error(e, node.id))?;
        }
        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get(
        &self,
        id: Uuid,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(select_columns(projection));
        qb.push(" FROM node_executions WHERE id = ");
        qb.push_bind(id.to_string());

        let row = qb
            .build()
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.map(|r| decode_node(&r, projection)).transpose()
    }

    async fn find(
        &self,
        filter: &NodeFilter,
        projection: &Projection,
    ) -> Result<Vec<NodeExecution>, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(select_columns(projection));
        qb.push(" FROM node_executions WHERE ");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at ASC, id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter().map(|r| decode_node(r, projection)).collect()
    }

    async fn count(&self, filter: &NodeFilter) -> Result<u64, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM node_executions WHERE ");
        push_filter(&mut qb, filter);

        let row = qb
            .build()
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;
        let count: i64 = row.try_get(0).map_err(query_error)?;
        Ok(count as u64)
    }

    async fn replace(&self, node: &NodeExecution) -> Result<NodeExecution, RepositoryError> {
        let mut saved = node.clone();
        saved.version += 1;

        let sql = replace_sql();
        let row = NodeRow::from_domain(&saved)?
            .bind_where(sqlx::query(&sql), replaced_column)
            .bind(node.id.to_string())
            .bind(node.version)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            let stored: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM node_executions WHERE id = ?")
                    .bind(node.id.to_string())
                    .fetch_optional(&self.pool.writer)
                    .await
                    .map_err(query_error)?;
            return Err(match stored {
                Some((version,)) => RepositoryError::Conflict(format!(
                    "node execution {} version {} is stale (stored {version})",
                    node.id, node.version
                )),
                None => RepositoryError::NotFound,
            });
        };
        decode_node(&row, &Projection::all())
    }

    async fn update_fields(
        &self,
        id: Uuid,
        update: &NodeUpdate,
        now: DateTime<Utc>,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE node_executions");
        push_set_clause(&mut qb, update, &now)?;
        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());
        qb.push(" RETURNING ");
        qb.push(select_columns(projection));

        let row = qb
            .build()
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        row.map(|r| decode_node(&r, projection)).transpose()
    }

    async fn update_many(
        &self,
        filter: &NodeFilter,
        update: &NodeUpdate,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE node_executions");
        push_set_clause(&mut qb, update, &now)?;
        qb.push(" WHERE ");
        push_filter(&mut qb, filter);

        let result = qb
            .build()
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn transition(
        &self,
        id: Uuid,
        allowed: &[Status],
        change: &StatusChange,
        projection: &Projection,
    ) -> Result<Option<NodeExecution>, RepositoryError> {
        if allowed.is_empty() {
            return Ok(None);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE node_executions");
        push_status_change(&mut qb, change)?;
        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in allowed {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(") RETURNING ");
        qb.push(select_columns(projection));

        let row = qb
            .build()
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        row.map(|r| decode_node(&r, projection)).transpose()
    }

    async fn transition_many(
        &self,
        filter: &NodeFilter,
        change: &StatusChange,
    ) -> Result<u64, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE node_executions");
        push_status_change(&mut qb, change)?;
        qb.push(" WHERE ");
        push_filter(&mut qb, filter);

        let result = qb
            .build()
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_ids(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM node_executions WHERE ");
        push_ids(&mut qb, ids);

        let result = qb
            .build()
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn distinct_statuses(&self, filter: &NodeFilter) -> Result<Vec<Status>, RepositoryError> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT DISTINCT status FROM node_executions WHERE ");
        push_filter(&mut qb, filter);

        let rows = qb
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        let mut statuses = BTreeSet::new();
        for row in &rows {
            let raw: String = row.try_get("status").map_err(query_error)?;
            statuses.insert(raw.parse::<Status>().map_err(RepositoryError::Query)?);
        }
        Ok(statuses.into_iter().collect())
    }

    async fn count_by_account(
        &self,
        filter: &NodeFilter,
    ) -> Result<Vec<(String, u64)>, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT account_id, COUNT(*) AS total FROM node_executions WHERE ",
        );
        push_filter(&mut qb, filter);
        qb.push(" GROUP BY account_id ORDER BY account_id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        rows.iter()
            .map(|row| {
                let account: String = row.try_get("account_id").map_err(query_error)?;
                let total: i64 = row.try_get("total").map_err(query_error)?;
                Ok((account, total as u64))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use nodeflow_core::event::OrchestrationEventBus;
    use nodeflow_core::execution::{NodeExecutionStore, ObserverRegistry, StatusStateMachine};
    use nodeflow_types::execution::{
        Ambiance, ExecutableResponse, ExecutionMode, FailureInfo, FailureType, InterruptHistory,
        InterruptType, StepCategory,
    };
    use nodeflow_types::query::{Criterion, FieldUpdate, NodeField};

    async fn test_pool() -> (DatabasePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (pool, dir)
    }

    fn node(plan: Uuid, identifier: &str, status: Status) -> NodeExecution {
        NodeExecution::new(
            Ambiance::new("acct", plan),
            identifier,
            identifier,
            StepCategory::Step,
        )
        .with_status(status)
    }

    #[tokio::test]
    async fn insert_and_get_round_trips_nested_fields() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let plan = Uuid::now_v7();
        let mut n = node(plan, "build", Status::TaskWaiting)
            .with_mode(ExecutionMode::Task)
            .with_stage_fqn("pipeline.stages.build");
        n.executable_responses
            .push(ExecutableResponse::Task { task_id: "t-1".into() });
        n.resolved_parameters = Some(serde_json::json!({"command": "make"}));
        n.timeout_instance_ids = vec!["timer-1".into()];
        repo.insert(&n).await.unwrap();

        let stored = repo.get(n.id, &Projection::all()).await.unwrap().unwrap();
        assert_eq!(stored.id, n.id);
        assert_eq!(stored.plan_execution_id, plan);
        assert_eq!(stored.status, Status::TaskWaiting);
        assert_eq!(stored.mode, Some(ExecutionMode::Task));
        assert_eq!(stored.stage_fqn.as_deref(), Some("pipeline.stages.build"));
        assert_eq!(stored.executable_responses, n.executable_responses);
        assert_eq!(stored.resolved_parameters, n.resolved_parameters);
        assert_eq!(stored.timeout_instance_ids, vec!["timer-1".to_string()]);
        assert_eq!(stored.ambiance.account_id, "acct");
        assert_eq!(stored.pending_callback_ids(), vec!["t-1".to_string()]);
    }

    #[tokio::test]
    async fn get_fills_only_projected_fields() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let mut n = node(Uuid::now_v7(), "build", Status::Running);
        n.outcome = Some(serde_json::json!({"ok": true}));
        repo.insert(&n).await.unwrap();

        let partial = repo
            .get(n.id, &Projection::of(&[NodeField::Status]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(partial.id, n.id);
        assert_eq!(partial.status, Status::Running);
        assert!(partial.outcome.is_none());
        assert!(partial.identifier.is_empty());
    }

    #[tokio::test]
    async fn duplicate_insert_is_conflict() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let n = node(Uuid::now_v7(), "a", Status::Queued);
        repo.insert(&n).await.unwrap();
        assert!(matches!(repo.insert(&n).await, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn insert_all_is_atomic() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let plan = Uuid::now_v7();
        let a = node(plan, "a", Status::Queued);
        let b = node(plan, "b", Status::Queued);
        repo.insert(&a).await.unwrap();

        let err = repo.insert_all(&[b.clone(), a.clone()]).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(repo.get(b.id, &Projection::ids_only()).await.unwrap().is_none());

        let c = node(plan, "c", Status::Queued);
        repo.insert_all(&[b, c]).await.unwrap();
        assert_eq!(repo.count(&NodeFilter::plan(plan)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn find_applies_alternatives_and_orders_by_creation() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let plan = Uuid::now_v7();
        let running = node(plan, "a", Status::Running);
        let queued = node(plan, "b", Status::Queued);
        let mut retried = node(plan, "c", Status::Failed);
        retried.old_retry = true;
        let done = node(plan, "d", Status::Succeeded);
        let other = node(Uuid::now_v7(), "e", Status::Running);
        for n in [&running, &queued, &retried, &done, &other] {
            repo.insert(n).await.unwrap();
        }

        let filter = NodeFilter::plan(plan)
            .current()
            .or(NodeFilter::new().status_in([Status::Running]))
            .or(NodeFilter::new().status_in([Status::Failed, Status::Queued]));
        let found = repo.find(&filter, &Projection::ids_only()).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![running.id, queued.id]);

        let not_final = NodeFilter::plan(plan).and(Criterion::StatusNotIn(vec![
            Status::Succeeded,
            Status::Failed,
        ]));
        assert_eq!(repo.count(&not_final).await.unwrap(), 2);

        let none = NodeFilter::plan(plan).ids(Vec::new());
        assert_eq!(repo.count(&none).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transition_is_guarded_by_status() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let mut n = node(Uuid::now_v7(), "a", Status::Running);
        n.timeout_instance_ids = vec!["timer".into()];
        repo.insert(&n).await.unwrap();

        let change = StatusChange::new(
            Status::Succeeded,
            NodeUpdate::new().set(FieldUpdate::Outcome(serde_json::json!({"exit": 0}))),
        );
        let projection = Projection::all();
        let moved = repo
            .transition(n.id, &[Status::Running], &change, &projection)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.status, Status::Succeeded);
        assert_eq!(moved.version, 1);
        assert!(moved.end_ts.is_some());
        assert!(moved.timeout_instance_ids.is_empty());
        assert_eq!(moved.outcome, Some(serde_json::json!({"exit": 0})));

        let again = repo
            .transition(n.id, &[Status::Running], &change, &projection)
            .await
            .unwrap();
        assert!(again.is_none());
        assert!(
            repo.transition(Uuid::now_v7(), &[Status::Running], &change, &projection)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn transition_appends_and_overwrites_in_op_order() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let n = node(Uuid::now_v7(), "a", Status::Running);
        repo.insert(&n).await.unwrap();

        let change = StatusChange::new(
            Status::Failed,
            NodeUpdate::new()
                .set(FieldUpdate::AddInterruptHistory(InterruptHistory::new(
                    InterruptType::Abort,
                    "alice",
                )))
                .set(FieldUpdate::FailureInfo(FailureInfo::new("first", FailureType::Timeout)))
                .set(FieldUpdate::AddInterruptHistory(InterruptHistory::new(
                    InterruptType::Retry,
                    "bob",
                )))
                .set(FieldUpdate::FailureInfo(FailureInfo::new("second", FailureType::Executor))),
        );
        let moved = repo
            .transition(n.id, &[Status::Running], &change, &Projection::all())
            .await
            .unwrap()
            .unwrap();

        let issued: Vec<&str> = moved
            .interrupt_histories
            .iter()
            .map(|h| h.issued_by.as_str())
            .collect();
        assert_eq!(issued, vec!["alice", "bob"]);
        let failure = moved.failure_info.unwrap();
        assert_eq!(failure.message, "second");
        assert_eq!(failure.failure_type, FailureType::Executor);
    }

    #[tokio::test]
    async fn expired_keeps_timeouts() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let mut n = node(Uuid::now_v7(), "a", Status::Running);
        n.timeout_instance_ids = vec!["timer".into()];
        repo.insert(&n).await.unwrap();

        let change = StatusChange::new(Status::Expired, NodeUpdate::new());
        let moved = repo
            .transition(n.id, &[Status::Running], &change, &Projection::all())
            .await
            .unwrap()
            .unwrap();
        assert!(moved.end_ts.is_some());
        assert_eq!(moved.timeout_instance_ids, vec!["timer".to_string()]);
    }

    #[tokio::test]
    async fn transition_many_and_update_many() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let plan = Uuid::now_v7();
        let a = node(plan, "a", Status::Running);
        let b = node(plan, "b", Status::Queued);
        let c = node(plan, "c", Status::Succeeded);
        repo.insert_all(&[a.clone(), b.clone(), c.clone()]).await.unwrap();

        let filter = NodeFilter::plan(plan).status_in([Status::Running, Status::Queued]);
        let change = StatusChange::new(Status::Aborted, NodeUpdate::new());
        assert_eq!(repo.transition_many(&filter, &change).await.unwrap(), 2);
        assert_eq!(
            repo.distinct_statuses(&NodeFilter::plan(plan)).await.unwrap(),
            vec![Status::Succeeded, Status::Aborted]
                .into_iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
        );

        let next = Uuid::now_v7();
        let changed = repo
            .update_many(
                &NodeFilter::new().ids(vec![a.id, b.id]),
                &NodeUpdate::new().set(FieldUpdate::NextId(next)),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(changed, 2);
        let stored = repo.get(b.id, &Projection::all()).await.unwrap().unwrap();
        assert_eq!(stored.next_id, Some(next));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn update_fields_of_missing_record_is_none() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let updated = repo
            .update_fields(
                Uuid::now_v7(),
                &NodeUpdate::new().set(FieldUpdate::OldRetry(true)),
                Utc::now(),
                &Projection::ids_only(),
            )
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn replace_checks_version() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let mut n = node(Uuid::now_v7(), "a", Status::Running);
        repo.insert(&n).await.unwrap();

        n.name = "renamed".into();
        let saved = repo.replace(&n).await.unwrap();
        assert_eq!(saved.version, 1);
        assert!(matches!(repo.replace(&n).await, Err(RepositoryError::Conflict(_))));

        let stored = repo.get(n.id, &Projection::all()).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.version, 1);

        let missing = node(Uuid::now_v7(), "x", Status::Queued);
        assert!(matches!(repo.replace(&missing).await, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn replace_never_moves_status() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let n = node(Uuid::now_v7(), "a", Status::Running);
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
        assert_eq!(saved.version, edited.version + 1);

        let reopen = StatusChange::new(Status::Failed, NodeUpdate::new());
        assert!(repo
            .transition(n.id, &[Status::Running], &reopen, &Projection::all())
            .await
            .unwrap()
            .is_none());
        let stored = repo.get(n.id, &Projection::all()).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Succeeded);
    }

    #[test]
    fn replace_sql_skips_transition_columns() {
        let sql = replace_sql();
        assert!(!sql.contains("status = ?"));
        assert!(!sql.contains("end_ts = ?"));
        assert!(sql.contains("name = ?"));
        assert_eq!(sql.matches('?').count(), COLUMNS.len() - TRANSITION_ONLY.len() + 2);
    }

    #[tokio::test]
    async fn delete_and_count_by_account() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteNodeExecutionRepository::new(pool);
        let plan = Uuid::now_v7();
        let a = node(plan, "a", Status::Running);
        let b = node(plan, "b", Status::Running);
        let mut other = node(Uuid::now_v7(), "c", Status::Running);
        other.ambiance.account_id = "zeta".into();
        repo.insert_all(&[a.clone(), b.clone(), other]).await.unwrap();

        let counts = repo
            .count_by_account(&NodeFilter::new().status_in([Status::Running]))
            .await
            .unwrap();
        assert_eq!(counts, vec![("acct".to_string(), 2), ("zeta".to_string(), 1)]);

        assert_eq!(repo.delete_ids(&[a.id, b.id]).await.unwrap(), 2);
        assert_eq!(repo.delete_ids(&[]).await.unwrap(), 0);
        assert_eq!(repo.count(&NodeFilter::plan(plan)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn state_machine_runs_on_sqlite() {
        let (pool, _dir) = test_pool().await;
        let store = NodeExecutionStore::new(
            SqliteNodeExecutionRepository::new(pool),
            Arc::new(ObserverRegistry::new()),
        );
        let sm = StatusStateMachine::new(Arc::new(store), OrchestrationEventBus::new(16));
        let created = sm.create(node(Uuid::now_v7(), "a", Status::Queued)).await.unwrap();

        let running = sm
            .transition(created.id, Status::Running, NodeUpdate::new(), &[])
            .await
            .unwrap();
        assert_eq!(running.unwrap().status, Status::Running);

        let illegal = sm
            .transition(created.id, Status::Queued, NodeUpdate::new(), &[])
            .await
            .unwrap();
        assert!(illegal.is_none());
    }
}
