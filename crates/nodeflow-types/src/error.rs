use thiserror::Error;
use uuid::Uuid;

/// Errors from repository operations (used by trait definitions in nodeflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Rejected input, raised before any store access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("projection must name at least one field")]
    EmptyProjection,

    #[error("batch of {size} ids exceeds maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("no step handler registered for type '{0}'")]
    UnknownStepType(String),

    #[error("invalid step spec: {0}")]
    InvalidStepSpec(String),

    #[error("invalid status: '{0}'")]
    InvalidStatus(String),
}

/// Errors surfaced by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("node execution {0} not found")]
    NodeNotFound(Uuid),

    #[error("callback '{0}' not found")]
    CallbackNotFound(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}
