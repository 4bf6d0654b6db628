use crate::types::FlowEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events published after they subscribed.
#[derive(Debug)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    /// Publish a free-form event under `topic`.
    pub fn emit(&self, topic: impl Into<String>, payload: serde_json::Value) {
        self.publish(FlowEvent::Custom {
            topic: topic.into(),
            payload,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
