//! Callback wait repository trait definition.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use nodeflow_types::callback::{CallbackWait, ResultPayload};
use nodeflow_types::error::RepositoryError;

/// Persistence for `callback id -> node execution` waits.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CallbackRepository: Send + Sync {
    /// Persist new waits. Registering an id twice is a `Conflict`.
    fn register(
        &self,
        waits: &[CallbackWait],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        callback_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<CallbackWait>, RepositoryError>> + Send;

    /// All waits registered for a node, oldest first.
    fn list_for_node(
        &self,
        node_execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<CallbackWait>, RepositoryError>> + Send;

    /// Store a terminal payload if the wait is still unresolved.
    /// `None` when the wait was already resolved or does not exist.
    fn resolve_once(
        &self,
        callback_id: &str,
        result: &ResultPayload,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<CallbackWait>, RepositoryError>> + Send;

    /// Record non-terminal progress on an unresolved wait.
    /// Returns `false` when the wait is already resolved or missing.
    fn record_progress(
        &self,
        callback_id: &str,
        progress: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete every wait belonging to a run.
    fn delete_for_plan(
        &self,
        plan_execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
