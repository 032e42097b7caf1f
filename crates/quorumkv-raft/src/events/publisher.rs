use std::sync::Arc;

use super::{Broker, RaftEvent, RaftEventListener};

/// Publishes host events on the broker as JSON, one subject per category.
pub struct RaftEventPublisher {
    broker: Arc<dyn Broker>,
}

impl RaftEventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

impl RaftEventListener for RaftEventPublisher {
    fn on_event(&self, event: RaftEvent) {
        let subject = event.subject();
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "failed to encode event");
                return;
            }
        };
        if let Err(e) = self.broker.publish(&subject, payload) {
            tracing::warn!(subject = %subject, error = %e, "failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LocalBroker;

    #[tokio::test]
    async fn test_events_are_published_by_category() {
        let broker = Arc::new(LocalBroker::new());
        let mut snapshots = broker.subscribe("system.events.snapshot").unwrap();
        let publisher = RaftEventPublisher::new(broker.clone());

        publisher.on_event(RaftEvent::HostShuttingDown);
        publisher.on_event(RaftEvent::SnapshotCreated {
            shard_id: 7,
            replica_id: 1,
            index: 40,
        });

        let message = snapshots.recv().await.unwrap();
        let event: RaftEvent = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(
            event,
            RaftEvent::SnapshotCreated {
                shard_id: 7,
                replica_id: 1,
                index: 40
            }
        );
    }
}
