//! Remote resource collaborator consumed by the sync step.

use std::future::Future;

use nodeflow_types::sync::{RemoteStatus, SyncItem};

/// Errors from the remote resource API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The remote resource no longer exists.
    #[error("remote resource not found: {0}")]
    NotFound(String),

    /// Network hiccup, rate limit, 5xx. Worth retrying.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The remote side refused the request outright.
    #[error("remote request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Status and sync calls against a remote reconciler.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RemoteResourceApi: Send + Sync {
    /// Current remote state of `item`.
    fn status(
        &self,
        item: &SyncItem,
    ) -> impl Future<Output = Result<RemoteStatus, RemoteError>> + Send;

    /// Ask the remote side to start syncing `item`. Returns once the request
    /// is accepted, not when the sync finishes.
    fn sync(&self, item: &SyncItem) -> impl Future<Output = Result<(), RemoteError>> + Send;
}
