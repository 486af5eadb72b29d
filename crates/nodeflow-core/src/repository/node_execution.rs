//! Node execution repository trait definition.
//!
//! Every read takes an explicit `Projection` and every multi-record operation
//! an explicit `NodeFilter`. Validation of both happens in
//! `NodeExecutionStore` before a repository is ever called.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use nodeflow_types::error::RepositoryError;
use nodeflow_types::execution::{NodeExecution, Status};
use nodeflow_types::query::{NodeFilter, NodeUpdate, Projection};

/// A status write plus the field updates that ride along with it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub target: Status,
    pub update: NodeUpdate,
    pub now: DateTime<Utc>,
}

impl StatusChange {
    pub fn new(target: Status, update: NodeUpdate) -> Self {
        Self {
            target,
            update,
            now: Utc::now(),
        }
    }

    /// Terminal targets stamp `end_ts`.
    pub fn sets_end_ts(&self) -> bool {
        self.target.is_final()
    }

    /// Terminal targets other than EXPIRED drop their timeout registrations.
    pub fn clears_timeouts(&self) -> bool {
        self.target.is_final() && self.target != Status::Expired
    }

    /// Apply to an in-memory record. Repositories that translate the change
    /// into a query must produce the same result.
    pub fn apply(&self, node: &mut NodeExecution) {
        node.status = self.target;
        self.update.apply(node);
        if self.sets_end_ts() {
            node.end_ts = Some(self.now);
        }
        if self.clears_timeouts() {
            node.timeout_instance_ids.clear();
        }
        node.last_updated_at = self.now;
        node.version += 1;
    }
}

/// Repository trait for node execution persistence.
///
/// Implementations live in nodeflow-infra (`SqliteNodeExecutionRepository`)
/// and in `crate::store::memory`.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait NodeExecutionRepository: Send + Sync {
    /// Insert a new record.
    fn insert(
        &self,
        node: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Insert several records at once.
    fn insert_all(
        &self,
        nodes: &[NodeExecution],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Read one record by id.
    fn get(
        &self,
        id: Uuid,
        projection: &Projection,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Read every record matching `filter`, ordered by creation time.
    fn find(
        &self,
        filter: &NodeFilter,
        projection: &Projection,
    ) -> impl std::future::Future<Output = Result<Vec<NodeExecution>, RepositoryError>> + Send;

    fn count(
        &self,
        filter: &NodeFilter,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Full-document save. Fails with `Conflict` when the stored version
    /// differs from `node.version`. `status` and `end_ts` keep their stored
    /// values; they only change through `transition`. Returns the saved
    /// record with its new version.
    fn replace(
        &self,
        node: &NodeExecution,
    ) -> impl std::future::Future<Output = Result<NodeExecution, RepositoryError>> + Send;

    /// Apply non-status field updates to one record and stamp
    /// `last_updated_at`. `None` when the id does not exist.
    fn update_fields(
        &self,
        id: Uuid,
        update: &NodeUpdate,
        now: DateTime<Utc>,
        projection: &Projection,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Apply non-status field updates to every matching record.
    fn update_many(
        &self,
        filter: &NodeFilter,
        update: &NodeUpdate,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Atomic conditional write: apply `change` only when the persisted status
    /// is in `allowed`. `None` when nothing matched.
    fn transition(
        &self,
        id: Uuid,
        allowed: &[Status],
        change: &StatusChange,
        projection: &Projection,
    ) -> impl std::future::Future<Output = Result<Option<NodeExecution>, RepositoryError>> + Send;

    /// Apply `change` to every record matching `filter` in one statement.
    /// The caller's filter carries the predecessor constraint.
    fn transition_many(
        &self,
        filter: &NodeFilter,
        change: &StatusChange,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Delete records by id.
    fn delete_ids(
        &self,
        ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Distinct statuses among matching records.
    fn distinct_statuses(
        &self,
        filter: &NodeFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Status>, RepositoryError>> + Send;

    /// Count matching records grouped by ambiance account id.
    fn count_by_account(
        &self,
        filter: &NodeFilter,
    ) -> impl std::future::Future<Output = Result<Vec<(String, u64)>, RepositoryError>> + Send;
}
