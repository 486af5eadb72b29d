//! Broadcast bus for `OrchestrationEvent`.
//!
//! Publishing is best-effort and decoupled from persistence: an event is
//! published only after its write has committed, and publishing with no
//! active subscribers is a no-op.

use nodeflow_types::event::OrchestrationEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for orchestration events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct OrchestrationEventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl OrchestrationEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: OrchestrationEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for OrchestrationEventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for OrchestrationEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
