//! Bounded polling reconciliation for externally-managed work that has no
//! push completion, illustrated by a GitOps-style sync step.

pub mod eligibility;
pub mod poll_loop;
pub mod remote;
pub mod retry;
pub mod sync_step;

pub use eligibility::{check_eligibility, partition_eligible};
pub use poll_loop::PollingLoop;
pub use remote::{RemoteError, RemoteResourceApi};
pub use retry::RetryPolicy;
pub use sync_step::{SyncReconciler, SyncStep, SyncStepParameters};
