//! Subject-based message broker.
//!
//! Subjects are dot-separated tokens. Subscription patterns may use `*` to
//! match exactly one token and a trailing `>` to match one or more.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// One published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pattern: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message, or `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Publish/subscribe transport for system events.
pub trait Broker: Send + Sync {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    fn subscribe(&self, pattern: &str) -> Result<Subscription>;
}

struct Subscriber {
    id: u64,
    pattern: Vec<String>,
    tx: mpsc::UnboundedSender<Message>,
}

/// In-process broker.
pub struct LocalBroker {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().iter().filter(|s| !s.tx.is_closed()).count()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for LocalBroker {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        validate_subject(subject)?;
        let tokens: Vec<&str> = subject.split('.').collect();

        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                if subscriber.tx.is_closed() {
                    closed = true;
                    continue;
                }
                if !matches(&subscriber.pattern, &tokens) {
                    continue;
                }
                let message = Message {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                };
                if subscriber.tx.send(message).is_err() {
                    closed = true;
                }
            }
        }

        if closed {
            self.subscribers.write().retain(|s| {
                let open = !s.tx.is_closed();
                if !open {
                    tracing::debug!(subscription_id = s.id, "subscription pruned");
                }
                open
            });
        }
        tracing::trace!(subject, "published");
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let tokens = parse_pattern(pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber { id, pattern: tokens, tx });
        tracing::debug!(subscription_id = id, pattern, "subscription created");
        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            rx,
        })
    }
}

fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.split('.').any(|t| t.is_empty() || t == "*" || t == ">") {
        return Err(Error::Rejected(format!("invalid subject {subject:?}")));
    }
    Ok(())
}

fn parse_pattern(pattern: &str) -> Result<Vec<String>> {
    let tokens: Vec<String> = pattern.split('.').map(str::to_string).collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() || (token == ">" && i != last) {
            return Err(Error::Rejected(format!("invalid subscription pattern {pattern:?}")));
        }
    }
    Ok(tokens)
}

fn matches(pattern: &[String], subject: &[&str]) -> bool {
    for (i, token) in pattern.iter().enumerate() {
        match token.as_str() {
            ">" => return subject.len() > i,
            "*" if i < subject.len() => {}
            literal if subject.get(i) == Some(&literal) => {}
            _ => return false,
        }
    }
    pattern.len() == subject.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> Vec<String> {
        parse_pattern(p).unwrap()
    }

    #[test]
    fn test_wildcards() {
        let subject = ["system", "events", "raft"];
        assert!(matches(&pattern("system.events.raft"), &subject));
        assert!(matches(&pattern("system.*.raft"), &subject));
        assert!(matches(&pattern("system.events.>"), &subject));
        assert!(matches(&pattern(">"), &subject));
        assert!(!matches(&pattern("system.events"), &subject));
        assert!(!matches(&pattern("system.events.raft.>"), &subject));
        assert!(!matches(&pattern("system.*"), &subject));
        assert!(!matches(&pattern("system.events.host"), &subject));
    }

    #[test]
    fn test_invalid_patterns_and_subjects() {
        let broker = LocalBroker::new();
        assert!(broker.subscribe("a.>.b").is_err());
        assert!(broker.subscribe("a..b").is_err());
        assert!(broker.publish("a.*", Vec::new()).is_err());
        assert!(broker.publish("", Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_delivery_and_pruning() {
        let broker = LocalBroker::new();
        let mut all = broker.subscribe("system.events.>").unwrap();
        let node = broker.subscribe("system.events.node").unwrap();
        assert_eq!(broker.subscription_count(), 2);

        drop(node);
        broker.publish("system.events.raft", b"leader".to_vec()).unwrap();
        assert_eq!(broker.subscription_count(), 1);

        let message = all.recv().await.unwrap();
        assert_eq!(message.subject, "system.events.raft");
        assert_eq!(message.payload, b"leader");
    }
}
