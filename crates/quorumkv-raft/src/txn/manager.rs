//! Client sessions exposed as [`Transaction`] values.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use quorumkv_proto::{series, Transaction};

use crate::error::{Error, Result};
use crate::host::NodeHost;
use crate::statemachine::SmResult;
use crate::types::{SessionHeader, ShardId};

/// Floor for the background unregistration after a registration timeout.
const MIN_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Host-side state of one registered client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub shard_id: ShardId,
    pub client_id: u64,
    /// Series id of the proposal in progress.
    pub series_id: u64,
    /// Highest series id completed by the client.
    pub responded_to: u64,
}

impl Session {
    fn new(shard_id: ShardId, client_id: u64) -> Self {
        Self {
            shard_id,
            client_id,
            series_id: series::FIRST_PROPOSAL,
            responded_to: 0,
        }
    }

    fn transaction(&self) -> Transaction {
        Transaction {
            shard_id: self.shard_id,
            client_id: self.client_id,
            transaction_id: self.series_id,
            responded_to: self.responded_to,
        }
    }
}

fn check_completable(txn: &Transaction) -> Result<()> {
    if txn.client_id == 0 {
        return Err(Error::UnsupportedTransaction("transaction has no client id".into()));
    }
    if !txn.is_completable() {
        return Err(Error::UnsupportedTransaction(format!(
            "transaction id {} of client {} is reserved",
            txn.transaction_id, txn.client_id
        )));
    }
    Ok(())
}

/// Opens, advances and closes client sessions, and proposes under them.
///
/// Sessions are cached by client id; several may be open per shard.
pub struct TransactionManager {
    host: Arc<NodeHost>,
    sessions: Mutex<HashMap<u64, Session>>,
}

impl TransactionManager {
    pub fn new(host: Arc<NodeHost>) -> Self {
        Self {
            host,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn new_client_id(&self) -> u64 {
        let mut rng = rand::thread_rng();
        let sessions = self.sessions.lock();
        loop {
            let id: u64 = rng.gen();
            if id != 0 && !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a new session on the shard and return its first transaction.
    pub async fn get_transaction(&self, shard_id: ShardId, timeout: Duration) -> Result<Transaction> {
        let client_id = self.new_client_id();
        if let Err(e) = self.host.register_session(shard_id, client_id, timeout).await {
            if matches!(e, Error::Timeout(_)) {
                self.release_unconfirmed(shard_id, client_id, timeout);
            }
            return Err(e);
        }

        let session = Session::new(shard_id, client_id);
        self.sessions.lock().insert(client_id, session);
        tracing::debug!(shard_id, client_id, "opened session");
        Ok(session.transaction())
    }

    /// A registration that timed out may still commit. Unregister the
    /// client in the background so the shard does not keep a session that
    /// no caller holds.
    fn release_unconfirmed(&self, shard_id: ShardId, client_id: u64, timeout: Duration) -> JoinHandle<()> {
        let host = self.host.clone();
        let timeout = timeout.max(MIN_RELEASE_TIMEOUT);
        tokio::spawn(async move {
            match host.unregister_session(shard_id, client_id, timeout).await {
                Ok(()) => tracing::debug!(shard_id, client_id, "released session of timed-out registration"),
                Err(Error::SessionExpired { .. }) => {
                    tracing::debug!(shard_id, client_id, "timed-out registration never committed")
                }
                Err(e) => {
                    tracing::warn!(shard_id, client_id, error = %e, "failed to release session of timed-out registration")
                }
            }
        })
    }

    /// A fire-and-forget transaction: never cached, never deduplicated.
    pub fn get_noop_transaction(&self, shard_id: ShardId) -> Transaction {
        Transaction::noop(shard_id, self.new_client_id())
    }

    /// Complete the current proposal and return the transaction for the
    /// next one in the same session.
    pub fn commit(&self, txn: &Transaction) -> Result<Transaction> {
        check_completable(txn)?;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&txn.client_id)
            .ok_or(Error::SessionNotFound(txn.client_id))?;
        if session.series_id != txn.transaction_id {
            return Err(Error::Rejected(format!(
                "transaction {} of client {} is not current, expected {}",
                txn.transaction_id, txn.client_id, session.series_id
            )));
        }

        session.responded_to = session.series_id;
        session.series_id += 1;
        Ok(session.transaction())
    }

    /// Unregister the session from its shard and forget it.
    pub async fn close_transaction(&self, txn: &Transaction, timeout: Duration) -> Result<()> {
        check_completable(txn)?;
        let session = self
            .sessions
            .lock()
            .get(&txn.client_id)
            .copied()
            .ok_or(Error::SessionNotFound(txn.client_id))?;

        match self
            .host
            .unregister_session(session.shard_id, session.client_id, timeout)
            .await
        {
            Ok(()) | Err(Error::SessionExpired { .. }) => {
                self.sessions.lock().remove(&txn.client_id);
                tracing::debug!(shard_id = session.shard_id, client_id = session.client_id, "closed session");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Propose a payload under the transaction's session.
    pub async fn propose(&self, txn: &Transaction, payload: Vec<u8>, timeout: Duration) -> Result<SmResult> {
        let header = if txn.is_noop() {
            SessionHeader {
                client_id: txn.client_id,
                series_id: series::NOOP,
                responded_to: 0,
            }
        } else {
            check_completable(txn)?;
            if !self.sessions.lock().contains_key(&txn.client_id) {
                return Err(Error::SessionNotFound(txn.client_id));
            }
            SessionHeader {
                client_id: txn.client_id,
                series_id: txn.transaction_id,
                responded_to: txn.responded_to,
            }
        };
        self.host.propose(txn.shard_id, header, payload, timeout).await
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::HostConfig;
    use crate::events::NoopListener;
    use crate::host::StartOptions;
    use crate::statemachine::StateMachineType;
    use crate::types::{ReplicaNode, ReplicaRole};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn manager(dir: &std::path::Path) -> TransactionManager {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let config = HostConfig::new(dir)
            .with_raft_addr(addr)
            .with_heartbeat_interval_ms(50)
            .with_election_timeout_ms(150, 300);
        let host = NodeHost::new(config, Arc::new(NoopListener)).await.unwrap();
        TransactionManager::new(Arc::new(host))
    }

    async fn bootstrap(host: &NodeHost, shard_id: ShardId) {
        let members = BTreeMap::from([(1, ReplicaNode::replica(host.raft_address()))]);
        host.start_replica(
            shard_id,
            1,
            ReplicaRole::Replica,
            StateMachineType::InMemory,
            StartOptions::bootstrap(members),
        )
        .await
        .unwrap();
        host.sync_membership(shard_id, TIMEOUT).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_registration_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        bootstrap(&manager.host, 20).await;

        // No time budget: the proposal is queued but the caller gives up.
        let err = manager.get_transaction(20, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "unexpected {err:?}");
        assert!(manager.is_empty());

        // A registration that did commit is undone by the release.
        manager.host.register_session(20, 99, TIMEOUT).await.unwrap();
        manager.release_unconfirmed(20, 99, TIMEOUT).await.unwrap();
        assert!(matches!(
            manager.host.unregister_session(20, 99, TIMEOUT).await,
            Err(Error::SessionExpired { client_id: 99 })
        ));

        // The shard still accepts new sessions afterwards.
        let txn = manager.get_transaction(20, TIMEOUT).await.unwrap();
        manager.close_transaction(&txn, TIMEOUT).await.unwrap();
        manager.host.close().await;
    }

    #[tokio::test]
    async fn test_reserved_transactions_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;

        let noop = manager.get_noop_transaction(1_000);
        assert!(noop.is_noop());
        assert_ne!(noop.client_id, 0);
        assert!(manager.is_empty());
        assert!(matches!(manager.commit(&noop), Err(Error::UnsupportedTransaction(_))));

        let nil = Transaction::default();
        assert!(matches!(manager.commit(&nil), Err(Error::UnsupportedTransaction(_))));

        for reserved in [series::REGISTRATION, series::UNREGISTRATION] {
            let txn = Transaction {
                transaction_id: reserved,
                ..Transaction::new(1_000, 42)
            };
            assert!(matches!(
                manager.close_transaction(&txn, Duration::from_secs(1)).await,
                Err(Error::UnsupportedTransaction(_))
            ));
            assert!(matches!(
                manager.propose(&txn, Vec::new(), Duration::from_secs(1)).await,
                Err(Error::UnsupportedTransaction(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let txn = Transaction::new(1_000, 42);
        assert!(matches!(manager.commit(&txn), Err(Error::SessionNotFound(42))));
    }
}
