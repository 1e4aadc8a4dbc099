//! In-process notification of committed events

use tokio::sync::broadcast;

use super::RecordedEvent;

/// Fan-out of committed events to subscribers (projectors, jobs).
///
/// Delivery is at-least-once from the subscriber's point of view: a lagging
/// receiver loses messages and is expected to catch up from the log.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RecordedEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: RecordedEvent) {
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordedEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
