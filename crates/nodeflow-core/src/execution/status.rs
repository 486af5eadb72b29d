//! Allowed-predecessor table for status transitions.
//!
//! `allowed_predecessors(target)` is the single source of truth for which
//! persisted statuses may move into `target`. Terminal statuses never appear
//! in any predecessor set, so a terminal record can never transition again.

use nodeflow_types::execution::Status;

/// Statuses from which a record may move into `target`.
pub fn allowed_predecessors(target: Status) -> Vec<Status> {
    use Status::*;

    match target {
        Queued => vec![QueuedLicenseLimitReached, ResourceWaiting],
        Running => vec![
            Queued,
            AsyncWaiting,
            TaskWaiting,
            ApprovalWaiting,
            ResourceWaiting,
            InputWaiting,
            InterventionWaiting,
            Paused,
            Pausing,
            QueuedLicenseLimitReached,
        ],
        AsyncWaiting | TaskWaiting => vec![Running, TaskWaiting, InterventionWaiting, Paused],
        InterventionWaiting => vec![Running, AsyncWaiting, TaskWaiting],
        ApprovalWaiting | InputWaiting | ResourceWaiting => vec![Queued, Running],
        QueuedLicenseLimitReached => vec![Queued],
        Pausing => vec![Queued, Running, AsyncWaiting, TaskWaiting],
        Paused => vec![Queued, Running, AsyncWaiting, TaskWaiting, Pausing],
        Succeeded | Skipped | IgnoreFailed => vec![
            Queued,
            Running,
            AsyncWaiting,
            TaskWaiting,
            InterventionWaiting,
            ApprovalWaiting,
            InputWaiting,
            ResourceWaiting,
        ],
        Failed => vec![
            Queued,
            Running,
            AsyncWaiting,
            TaskWaiting,
            InterventionWaiting,
            ApprovalWaiting,
            InputWaiting,
            ResourceWaiting,
            Discontinuing,
        ],
        ApprovalRejected => vec![ApprovalWaiting, AsyncWaiting, Running],
        Discontinuing => non_final_except(Discontinuing),
        Aborted | Expired | Errored => Status::active(),
    }
}

/// Whether a record in `from` may move into `to`.
pub fn can_transition(from: Status, to: Status) -> bool {
    allowed_predecessors(to).contains(&from)
}

fn non_final_except(excluded: Status) -> Vec<Status> {
    Status::active().into_iter().filter(|s| *s != excluded).collect()
}
