//! SQLite callback wait repository implementation.
//!
//! Implements `CallbackRepository` from `nodeflow-core`. A wait's terminal
//! result is written by a guarded `UPDATE .. WHERE result IS NULL`, so the
//! first delivery wins and every later one sees no row.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use nodeflow_core::repository::callback::CallbackRepository;
use nodeflow_types::callback::{CallbackWait, ResultPayload};
use nodeflow_types::error::RepositoryError;

use super::pool::DatabasePool;
use super::query::{format_datetime, from_json, parse_datetime, parse_optional_datetime, parse_uuid, to_json};

const WAIT_COLUMNS: &str =
    "callback_id, node_execution_id, plan_execution_id, created_at, progress, result, resolved_at";

/// SQLite-backed implementation of `CallbackRepository`.
pub struct SqliteCallbackRepository {
    pool: DatabasePool,
}

impl SqliteCallbackRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct WaitRow {
    callback_id: String,
    node_execution_id: String,
    plan_execution_id: String,
    created_at: String,
    progress: Option<String>,
    result: Option<String>,
    resolved_at: Option<String>,
}

impl WaitRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            callback_id: row.try_get("callback_id")?,
            node_execution_id: row.try_get("node_execution_id")?,
            plan_execution_id: row.try_get("plan_execution_id")?,
            created_at: row.try_get("created_at")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    fn into_domain(self) -> Result<CallbackWait, RepositoryError> {
        Ok(CallbackWait {
            callback_id: self.callback_id,
            node_execution_id: parse_uuid(&self.node_execution_id)?,
            plan_execution_id: parse_uuid(&self.plan_execution_id)?,
            created_at: parse_datetime(&self.created_at)?,
            progress: self
                .progress
                .map(|p| from_json(&p, "progress"))
                .transpose()?,
            result: self.result.map(|r| from_json(&r, "result")).transpose()?,
            resolved_at: parse_optional_datetime(self.resolved_at)?,
        })
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<CallbackWait, RepositoryError> {
    WaitRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_domain()
}

// ---------------------------------------------------------------------------
// CallbackRepository implementation
// ---------------------------------------------------------------------------

impl CallbackRepository for SqliteCallbackRepository {
    async fn register(&self, waits: &[CallbackWait]) -> Result<(), RepositoryError> {
        if waits.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for wait in waits {
            let progress = wait.progress.as_ref().map(to_json).transpose()?;
            let result = wait.result.as_ref().map(to_json).transpose()?;
            sqlx::query(
                r#"INSERT INTO callback_waits
                   (callback_id, node_execution_id, plan_execution_id, created_at,
                    progress, result, resolved_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&wait.callback_id)
            .bind(wait.node_execution_id.to_string())
            .bind(wait.plan_execution_id.to_string())
            .bind(format_datetime(&wait.created_at))
            .bind(progress)
            .bind(result)
            .bind(wait.resolved_at.as_ref().map(format_datetime))
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.message().contains("UNIQUE") {
                        return RepositoryError::Conflict(format!(
                            "callback '{}' is already registered",
                            wait.callback_id
                        ));
                    }
                }
                RepositoryError::Query(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, callback_id: &str) -> Result<Option<CallbackWait>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {WAIT_COLUMNS} FROM callback_waits WHERE callback_id = ?"
        ))
        .bind(callback_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_for_node(
        &self,
        node_execution_id: Uuid,
    ) -> Result<Vec<CallbackWait>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {WAIT_COLUMNS} FROM callback_waits WHERE node_execution_id = ? \
             ORDER BY created_at ASC, callback_id ASC"
        ))
        .bind(node_execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode).collect()
    }

    async fn resolve_once(
        &self,
        callback_id: &str,
        result: &ResultPayload,
        now: DateTime<Utc>,
    ) -> Result<Option<CallbackWait>, RepositoryError> {
        let row = sqlx::query(&format!(
            "UPDATE callback_waits SET result = ?, resolved_at = ? \
             WHERE callback_id = ? AND result IS NULL RETURNING {WAIT_COLUMNS}"
        ))
        .bind(to_json(result)?)
        .bind(format_datetime(&now))
        .bind(callback_id)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode).transpose()
    }

    async fn record_progress(
        &self,
        callback_id: &str,
        progress: &serde_json::Value,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE callback_waits SET progress = ? WHERE callback_id = ? AND result IS NULL",
        )
        .bind(to_json(progress)?)
        .bind(callback_id)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_for_plan(&self, plan_execution_id: Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM callback_waits WHERE plan_execution_id = ?")
            .bind(plan_execution_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_repo() -> (SqliteCallbackRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteCallbackRepository::new(pool), dir)
    }

    #[tokio::test]
    async fn register_and_get() {
        let (repo, _dir) = test_repo().await;
        let node = Uuid::now_v7();
        let plan = Uuid::now_v7();
        let wait = CallbackWait::new("cb-1", node, plan);
        repo.register(std::slice::from_ref(&wait)).await.unwrap();

        let stored = repo.get("cb-1").await.unwrap().unwrap();
        assert_eq!(stored.node_execution_id, node);
        assert_eq!(stored.plan_execution_id, plan);
        assert!(!stored.is_resolved());
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_conflict_and_atomic() {
        let (repo, _dir) = test_repo().await;
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
    }

    #[tokio::test]
    async fn resolve_once_only_once() {
        let (repo, _dir) = test_repo().await;
        let wait = CallbackWait::new("cb", Uuid::now_v7(), Uuid::now_v7());
        repo.register(std::slice::from_ref(&wait)).await.unwrap();

        assert!(repo.record_progress("cb", &json!({"pct": 50})).await.unwrap());

        let first = ResultPayload::success(json!({"exit": 0}));
        let resolved = repo.resolve_once("cb", &first, Utc::now()).await.unwrap().unwrap();
        assert_eq!(resolved.result, Some(first));
        assert_eq!(resolved.progress, Some(json!({"pct": 50})));
        assert!(resolved.resolved_at.is_some());

        let late = ResultPayload::failure("too late");
        assert!(repo.resolve_once("cb", &late, Utc::now()).await.unwrap().is_none());
        assert!(!repo.record_progress("cb", &json!({"pct": 90})).await.unwrap());
        assert!(repo.resolve_once("missing", &late, Utc::now()).await.unwrap().is_none());

        let stored = repo.get("cb").await.unwrap().unwrap();
        assert_eq!(stored.result, Some(ResultPayload::success(json!({"exit": 0}))));
    }

    #[tokio::test]
    async fn list_and_delete_by_plan() {
        let (repo, _dir) = test_repo().await;
        let node = Uuid::now_v7();
        let plan = Uuid::now_v7();
        let other_plan = Uuid::now_v7();
        repo.register(&[
            CallbackWait::new("a", node, plan),
            CallbackWait::new("b", node, plan),
        ])
        .await
        .unwrap();
        repo.register(&[CallbackWait::new("c", Uuid::now_v7(), other_plan)])
            .await
            .unwrap();

        let ids: Vec<String> = repo
            .list_for_node(node)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.callback_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(repo.delete_for_plan(plan).await.unwrap(), 2);
        assert!(repo.list_for_node(node).await.unwrap().is_empty());
        assert!(repo.get("c").await.unwrap().is_some());
    }
}
