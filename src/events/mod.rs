//! Event bus for in-process space notifications
//!
//! Signaling sessions publish capture frames here; the agent bridge
//! subscribes and forwards them to active monitoring sessions.

pub mod types;

pub use types::{CaptureFrameEvent, SpaceEvent};

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`SpaceEvent`]s
///
/// A subscriber that falls too far behind receives `Lagged` and misses
/// frames, which is acceptable for live capture.
pub struct EventBus {
    tx: broadcast::Sender<SpaceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: SpaceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpaceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
