//! Node execution engine: store wrapper, status state machine, observers,
//! tree navigation and retry chains.

pub mod observer;
pub mod retry_chain;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod tree;

pub use observer::ObserverRegistry;
pub use retry_chain::RetryChain;
pub use state_machine::StatusStateMachine;
pub use status::allowed_predecessors;
pub use store::NodeExecutionStore;
pub use tree::TreeNavigator;
