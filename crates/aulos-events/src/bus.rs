use tokio::sync::broadcast;

use crate::StreamEvent;

/// Broadcast bus for playback lifecycle events.
///
/// Every component holds a cloned `EventBus` and publishes directly; the
/// host subscribes once. `publish()` is a sync call so it works from both
/// async tasks and blocking helpers. With no subscribers, events are
/// silently dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all subscribers.
    ///
    /// Accepts anything convertible into [`StreamEvent`], so error reports
    /// can be published directly and pick their severity themselves.
    pub fn publish<E: Into<StreamEvent>>(&self, event: E) {
        let _ = self.tx.send(event.into());
    }

    /// Subscribe to all future events.
    ///
    /// Slow subscribers observe `RecvError::Lagged(n)` instead of blocking
    /// publishers.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}
