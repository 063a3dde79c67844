//! The Event Bus: a typed publish/subscribe registry surfacing lifecycle
//! and data events to observers (spec.md §2 component 5, §6, §9).
//!
//! Grounded on `sorng-vnc`'s per-session `mpsc`-channel event fan-out
//! (`session.rs`/`service.rs`'s `SessionEvent`), adapted to
//! `tokio::sync::broadcast` because spec.md §6 requires every independent
//! subscriber to observe every event in emission order, not just one
//! consumer draining a queue.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A semantic event emitted by the protocol state machine or session
/// controller, in the order spec.md §9 calls "insertion-order delivery".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Connecting,
    Connected,
    Disconnected,
    Error { message: String },
    FramebufferUpdate { payload: Vec<u8> },
    ServerCutText { payload: Vec<u8> },
    Bell,
    Resize { width: u16, height: u16 },
}

/// The default channel capacity for the broadcast bus. A slow subscriber
/// that falls behind by this many events starts missing the oldest ones
/// (tokio broadcast semantics); 256 comfortably covers a framebuffer-update
/// burst between poll cycles.
const CHANNEL_CAPACITY: usize = 256;

/// Thin wrapper over `tokio::sync::broadcast` giving the controller a
/// single `emit` call and giving observers a typed `subscribe`.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Register a new observer. Each subscriber receives every event
    /// emitted after this call, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers. A send with no
    /// subscribers is not an error — it is simply dropped, matching
    /// `broadcast::Sender::send`'s semantics.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
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

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::Connecting);
        bus.emit(Event::Connected);
        bus.emit(Event::Bell);

        assert_eq!(rx.recv().await.unwrap(), Event::Connecting);
        assert_eq!(rx.recv().await.unwrap(), Event::Connected);
        assert_eq!(rx.recv().await.unwrap(), Event::Bell);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_all_events() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(Event::Connected);

        assert_eq!(rx1.recv().await.unwrap(), Event::Connected);
        assert_eq!(rx2.recv().await.unwrap(), Event::Connected);
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(Event::Disconnected);
    }

    #[test]
    fn error_event_carries_message() {
        let e = Event::Error {
            message: "boom".into(),
        };
        match e {
            Event::Error { message } => assert_eq!(message, "boom"),
            _ => panic!("wrong variant"),
        }
    }
}
