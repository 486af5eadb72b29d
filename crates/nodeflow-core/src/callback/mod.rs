//! Async callback protocol: step handlers, the step registry, the task
//! executor collaborator and the dispatch/resolve protocol itself.

pub mod executor;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod sink;

pub use executor::{DelegateTaskHandler, TaskExecutor};
pub use handler::{BoxStepHandler, StepHandler, StepResolution};
pub use protocol::{CallbackProtocol, DispatchOutcome};
pub use registry::StepRegistry;
pub use sink::{Completion, CompletionSender, completion_channel, run_completion_pump};
