//! State-change event fan-out.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::types::DeviceState;

/// A device's state as observed after applying one `props` push.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub addr: SocketAddr,
    pub state: DeviceState,
}

/// Broadcast bus carrying [`StateChange`] events from control sessions to
/// subscribers (the sync coordinator, UI layers, loggers).
///
/// Events from one device are published in the order its session read them;
/// no ordering is promised across devices. Slow subscribers that fall more
/// than the channel capacity behind lose the oldest events
/// (`broadcast` lag semantics), which suits state snapshots: the newest
/// event supersedes anything missed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateChange>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 128;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that will see it;
    /// publishing with no subscribers is not an error.
    pub fn publish(&self, event: StateChange) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceState;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        let event = StateChange {
            addr: "192.168.1.10:55443".parse().unwrap(),
            state: DeviceState::Off,
        };
        assert_eq!(bus.publish(event), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let addr: SocketAddr = "192.168.1.10:55443".parse().unwrap();

        bus.publish(StateChange {
            addr,
            state: DeviceState::Off,
        });
        bus.publish(StateChange {
            addr,
            state: DeviceState::Unknown,
        });

        assert_eq!(rx.recv().await.unwrap().state, DeviceState::Off);
        assert_eq!(rx.recv().await.unwrap().state, DeviceState::Unknown);
    }
}
