//! Per-address connection state, shared by every shard's network clients.

use std::sync::Arc;

use dashmap::DashMap;

use crate::events::{RaftEvent, RaftEventListener};

/// Tracks whether the last RPC to each peer address succeeded.
///
/// Events fire on transitions only: the first success to an address, or
/// the first failure after a success (or before any success).
pub struct ConnectionTracker {
    reachable: DashMap<String, bool>,
    listener: Arc<dyn RaftEventListener>,
}

impl ConnectionTracker {
    pub fn new(listener: Arc<dyn RaftEventListener>) -> Self {
        Self {
            reachable: DashMap::new(),
            listener,
        }
    }

    pub fn succeeded(&self, address: &str) {
        let previous = self.reachable.insert(address.to_string(), true);
        if previous != Some(true) {
            tracing::info!(address, "raft connection established");
            self.listener.on_event(RaftEvent::ConnectionEstablished {
                address: address.to_string(),
            });
        }
    }

    pub fn failed(&self, address: &str) {
        let previous = self.reachable.insert(address.to_string(), false);
        if previous != Some(false) {
            tracing::warn!(address, "raft connection failed");
            self.listener.on_event(RaftEvent::ConnectionFailed {
                address: address.to_string(),
            });
        }
    }

    pub fn is_reachable(&self, address: &str) -> Option<bool> {
        self.reachable.get(address).map(|r| *r)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RaftEvent>>);

    impl RaftEventListener for Recorder {
        fn on_event(&self, event: RaftEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_events_fire_on_transitions_only() {
        let recorder = Arc::new(Recorder::default());
        let tracker = ConnectionTracker::new(recorder.clone());

        tracker.succeeded("10.0.0.2:9101");
        tracker.succeeded("10.0.0.2:9101");
        tracker.failed("10.0.0.2:9101");
        tracker.failed("10.0.0.2:9101");
        tracker.succeeded("10.0.0.2:9101");

        let events = recorder.0.lock();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], RaftEvent::ConnectionEstablished { .. }));
        assert!(matches!(events[1], RaftEvent::ConnectionFailed { .. }));
        assert!(matches!(events[2], RaftEvent::ConnectionEstablished { .. }));
        assert_eq!(tracker.is_reachable("10.0.0.2:9101"), Some(true));
        assert_eq!(tracker.is_reachable("10.0.0.3:9101"), None);
    }
}
