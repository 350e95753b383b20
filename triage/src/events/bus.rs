//! Event bus for triage notifications
//!
//! Tokio broadcast pub/sub with an optional bounded in-memory history.
//! Publishing is fire-and-forget: it never fails, so a missing or lagging
//! subscriber can never roll back a registry mutation.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::history::EventHistory;
use super::types::TriageEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channels and optional history
pub struct EventBus {
    sender: broadcast::Sender<TriageEvent>,
    history: Option<EventHistory>,
}

impl EventBus {
    /// Create a new event bus without history
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: None,
        }
    }

    /// Create an event bus retaining the last `capacity` events
    pub fn with_history(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Some(EventHistory::new(capacity)),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: TriageEvent) {
        let event_type = event.event_type();
        if let Some(history) = &self.history {
            history.record(&event);
        }

        // No receivers is fine; delivery is best effort
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<TriageEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Retained history, if enabled
    pub fn history(&self) -> Option<&EventHistory> {
        self.history.as_ref()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn closed(id: &str) -> TriageEvent {
        TriageEvent::IssueClosed {
            issue_id: id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(closed("issue-1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "issue_closed");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(closed("issue-2"));

        assert_eq!(rx1.recv().await.unwrap().issue_id(), "issue-2");
        assert_eq!(rx2.recv().await.unwrap().issue_id(), "issue-2");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::with_history(4);
        bus.publish(closed("issue-3"));
        assert_eq!(bus.history().unwrap().len(), 1);
    }
}
