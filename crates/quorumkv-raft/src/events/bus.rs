//! Dispatch of published [`RaftEvent`]s to named callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{Broker, EventKind, RaftEvent, Subscription, ALL_EVENTS};
use crate::error::{Error, Result};

/// A registered event handler.
pub type Callback = Arc<dyn Fn(RaftEvent) -> BoxFuture<'static, ()> + Send + Sync>;

type CallbackTable = HashMap<EventKind, HashMap<String, Callback>>;

/// Typed callback table fed from the broker's system-event subjects.
///
/// Every callback runs in its own task, so a slow or panicking handler
/// holds up neither its siblings nor later events.
pub struct EventBus {
    broker: Arc<dyn Broker>,
    callbacks: Arc<RwLock<CallbackTable>>,
    running: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Register `callback` under `name` for `kind`, replacing any callback
    /// of the same name for that kind.
    pub fn register_callback(&self, name: impl Into<String>, kind: EventKind, callback: Callback) {
        let name = name.into();
        tracing::debug!(name = %name, ?kind, "registering event callback");
        self.callbacks.write().entry(kind).or_default().insert(name, callback);
    }

    pub fn unregister_callback(&self, name: &str, kind: EventKind) -> bool {
        let mut callbacks = self.callbacks.write();
        let Some(named) = callbacks.get_mut(&kind) else {
            return false;
        };
        let removed = named.remove(name).is_some();
        if named.is_empty() {
            callbacks.remove(&kind);
        }
        removed
    }

    pub fn callback_count(&self, kind: EventKind) -> usize {
        self.callbacks.read().get(&kind).map_or(0, HashMap::len)
    }

    /// Subscribe to every system-event subject and start dispatching.
    pub fn run(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::Rejected("event bus already running".into()));
        }
        let subscription = self.broker.subscribe(ALL_EVENTS)?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch(subscription, self.callbacks.clone(), stop_rx));
        *running = Some((stop_tx, task));
        tracing::info!(pattern = ALL_EVENTS, "event bus running");
        Ok(())
    }

    /// Drop the subscription. Callbacks already spawned may still be running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some((stop_tx, task)) = running {
            let _ = stop_tx.send(());
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "event dispatch task failed");
            }
            tracing::info!("event bus stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

async fn dispatch(
    mut subscription: Subscription,
    callbacks: Arc<RwLock<CallbackTable>>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            _ = &mut stop => break,
            message = subscription.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let event: RaftEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(subject = %message.subject, error = %e, "skipping undecodable event");
                continue;
            }
        };

        let handlers: Vec<Callback> = callbacks
            .read()
            .get(&event.kind())
            .map(|named| named.values().cloned().collect())
            .unwrap_or_default();
        for handler in handlers {
            tokio::spawn(handler(event.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::events::LocalBroker;

    fn forward(tx: mpsc::UnboundedSender<(String, RaftEvent)>, name: &'static str) -> Callback {
        Arc::new(move |event: RaftEvent| -> BoxFuture<'static, ()> {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((name.to_string(), event));
            })
        })
    }

    #[test]
    fn test_register_overwrites_by_name() {
        let bus = EventBus::new(Arc::new(LocalBroker::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        bus.register_callback("refresh", EventKind::LeaderUpdated, forward(tx.clone(), "a"));
        bus.register_callback("refresh", EventKind::LeaderUpdated, forward(tx.clone(), "b"));
        bus.register_callback("refresh", EventKind::NodeReady, forward(tx, "c"));
        assert_eq!(bus.callback_count(EventKind::LeaderUpdated), 1);
        assert_eq!(bus.callback_count(EventKind::NodeReady), 1);

        assert!(bus.unregister_callback("refresh", EventKind::LeaderUpdated));
        assert!(!bus.unregister_callback("refresh", EventKind::LeaderUpdated));
        assert_eq!(bus.callback_count(EventKind::LeaderUpdated), 0);
    }

    #[tokio::test]
    async fn test_events_reach_callbacks_of_their_kind() {
        let broker = Arc::new(LocalBroker::new());
        let bus = EventBus::new(broker.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register_callback("leader", EventKind::LeaderUpdated, forward(tx.clone(), "leader"));
        bus.register_callback("ready", EventKind::NodeReady, forward(tx, "ready"));
        bus.run().unwrap();
        assert!(bus.run().is_err());

        broker.publish("system.events.raft", b"not json".to_vec()).unwrap();
        let event = RaftEvent::LeaderUpdated {
            shard_id: 1_000,
            replica_id: 1,
            term: 2,
            leader_id: Some(1),
        };
        broker
            .publish(&event.subject(), serde_json::to_vec(&event).unwrap())
            .unwrap();

        let (name, received) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "leader");
        assert_eq!(received, event);

        bus.stop().await;
        assert!(!bus.is_running());
        assert!(rx.try_recv().is_err());
    }
}
