//! NNG-based raft network client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nng::options::{Options, RecvTimeout, SendTimeout};
use nng::{Protocol, Socket};
use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, ReplicationClosed, StreamingError,
    Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, SnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::Vote;

use super::connections::ConnectionTracker;
use super::messages::{RaftReply, RaftRequest};
use crate::error::{Error, Result};
use crate::events::{RaftEvent, RaftEventListener};
use crate::types::{NodeId, ReplicaId, ReplicaNode, ShardId, TypeConfig};

/// Snapshot chunk size for streamed installs.
const SNAPSHOT_CHUNK_SIZE: usize = 1024 * 1024;

/// Send one request and wait for the reply on a fresh REQ socket.
fn round_trip(addr: &str, timeout: Duration, payload: &[u8]) -> Result<Vec<u8>> {
    let socket =
        Socket::new(Protocol::Req0).map_err(|e| Error::Network(format!("failed to create socket: {e}")))?;
    socket
        .set_opt::<SendTimeout>(Some(timeout))
        .map_err(|e| Error::Network(format!("failed to set send timeout: {e}")))?;
    socket
        .set_opt::<RecvTimeout>(Some(timeout))
        .map_err(|e| Error::Network(format!("failed to set recv timeout: {e}")))?;

    let url = format!("tcp://{addr}");
    socket
        .dial(&url)
        .map_err(|e| Error::Network(format!("failed to connect to {url}: {e}")))?;
    socket
        .send(payload)
        .map_err(|(_, e)| Error::Network(format!("failed to send to {url}: {e}")))?;
    let reply = socket
        .recv()
        .map_err(|e| Error::Network(format!("failed to receive from {url}: {e}")))?;
    Ok(reply.as_slice().to_vec())
}

/// Raft network client for one (shard, target replica) pair.
pub struct NngRaftNetwork {
    shard_id: ShardId,
    replica_id: ReplicaId,
    target: NodeId,
    node: ReplicaNode,
    timeout: Duration,
    connections: Arc<ConnectionTracker>,
    listener: Arc<dyn RaftEventListener>,
}

impl NngRaftNetwork {
    pub fn new(
        shard_id: ShardId,
        replica_id: ReplicaId,
        target: NodeId,
        node: ReplicaNode,
        connections: Arc<ConnectionTracker>,
        listener: Arc<dyn RaftEventListener>,
    ) -> Self {
        Self {
            shard_id,
            replica_id,
            target,
            node,
            timeout: Duration::from_secs(5),
            connections,
            listener,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn address(&self) -> &str {
        &self.node.addr
    }

    async fn send(&self, request: RaftRequest) -> Result<RaftReply> {
        let payload = request.encode()?;
        let addr = self.node.addr.clone();
        let timeout = self.timeout;

        let outcome = tokio::task::spawn_blocking(move || round_trip(&addr, timeout, &payload))
            .await
            .map_err(|e| Error::Internal(format!("transport task failed: {e}")))?;

        match outcome {
            Ok(bytes) => {
                self.connections.succeeded(&self.node.addr);
                RaftReply::decode(&bytes)
            }
            Err(e) => {
                self.connections.failed(&self.node.addr);
                tracing::debug!(
                    shard_id = self.shard_id,
                    target = self.target,
                    rpc = request.name(),
                    error = %e,
                    "raft rpc failed"
                );
                Err(e)
            }
        }
    }

    fn rpc_error<E: std::error::Error>(&self, err: Error) -> RPCError<NodeId, ReplicaNode, E> {
        match err {
            Error::Network(_) => RPCError::Unreachable(Unreachable::new(&err)),
            other => RPCError::Network(NetworkError::new(&other)),
        }
    }

    fn snapshot_aborted(&self, index: u64) {
        self.listener.on_event(RaftEvent::SnapshotAborted {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            to: self.target,
            index,
        });
    }
}

impl RaftNetwork<TypeConfig> for NngRaftNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, ReplicaNode, RaftError<NodeId>>> {
        let request = RaftRequest::AppendEntries {
            shard_id: self.shard_id,
            rpc,
        };
        match self.send(request).await {
            Ok(RaftReply::AppendEntries(Ok(resp))) => Ok(resp),
            Ok(RaftReply::AppendEntries(Err(e))) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Ok(other) => Err(self.rpc_error(other.unexpected("append_entries"))),
            Err(e) => Err(self.rpc_error(e)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> std::result::Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, ReplicaNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let request = RaftRequest::InstallSnapshot {
            shard_id: self.shard_id,
            rpc,
        };
        match self.send(request).await {
            Ok(RaftReply::InstallSnapshot(Ok(resp))) => Ok(resp),
            Ok(RaftReply::InstallSnapshot(Err(e))) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Ok(other) => Err(self.rpc_error(other.unexpected("install_snapshot"))),
            Err(e) => Err(self.rpc_error(e)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> std::result::Result<VoteResponse<NodeId>, RPCError<NodeId, ReplicaNode, RaftError<NodeId>>> {
        let request = RaftRequest::Vote {
            shard_id: self.shard_id,
            rpc,
        };
        match self.send(request).await {
            Ok(RaftReply::Vote(Ok(resp))) => Ok(resp),
            Ok(RaftReply::Vote(Err(e))) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Ok(other) => Err(self.rpc_error(other.unexpected("vote"))),
            Err(e) => Err(self.rpc_error(e)),
        }
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote<NodeId>,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + Send + 'static,
        _option: RPCOption,
    ) -> std::result::Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let meta = snapshot.meta;
        let data = snapshot.snapshot.into_inner();
        let index = meta.last_log_id.map(|l| l.index).unwrap_or(0);

        tracing::info!(
            shard_id = self.shard_id,
            target = self.target,
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            "streaming snapshot"
        );

        // An empty image still needs one chunk carrying `done`.
        let mut offset = 0usize;
        loop {
            let end = (offset + SNAPSHOT_CHUNK_SIZE).min(data.len());
            let done = end == data.len();
            let request = RaftRequest::InstallSnapshot {
                shard_id: self.shard_id,
                rpc: InstallSnapshotRequest {
                    vote,
                    meta: meta.clone(),
                    offset: offset as u64,
                    data: data[offset..end].to_vec(),
                    done,
                },
            };

            match self.send(request).await {
                Ok(RaftReply::InstallSnapshot(Ok(resp))) => {
                    if resp.vote > vote {
                        self.snapshot_aborted(index);
                        return Ok(SnapshotResponse { vote: resp.vote });
                    }
                }
                Ok(RaftReply::InstallSnapshot(Err(e))) => {
                    self.snapshot_aborted(index);
                    return Err(StreamingError::Network(NetworkError::new(&e)));
                }
                Ok(other) => {
                    self.snapshot_aborted(index);
                    return Err(StreamingError::Network(NetworkError::new(
                        &other.unexpected("install_snapshot"),
                    )));
                }
                Err(e) => {
                    self.snapshot_aborted(index);
                    return Err(StreamingError::Unreachable(Unreachable::new(&e)));
                }
            }

            if done {
                break;
            }
            offset = end;
        }

        self.listener.on_event(RaftEvent::SnapshotCompleted {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            to: self.target,
            index,
        });
        Ok(SnapshotResponse { vote })
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, LogId};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RaftEvent>>);

    impl RaftEventListener for Recorder {
        fn on_event(&self, event: RaftEvent) {
            self.0.lock().push(event);
        }
    }

    fn unused_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn test_unreachable_peer_reports_connection_failure() {
        let recorder = Arc::new(Recorder::default());
        let tracker = Arc::new(ConnectionTracker::new(recorder.clone()));
        let addr = unused_addr();
        let mut network = NngRaftNetwork::new(3, 1, 2, ReplicaNode::replica(addr.clone()), tracker.clone(), recorder.clone())
            .with_timeout(Duration::from_millis(200));

        let rpc = VoteRequest::new(Vote::new(1, 1), Some(LogId::new(CommittedLeaderId::new(1, 1), 1)));
        let result = network.vote(rpc, RPCOption::new(Duration::from_millis(200))).await;

        assert!(matches!(result, Err(RPCError::Unreachable(_))));
        assert_eq!(tracker.is_reachable(&addr), Some(false));
        assert!(recorder
            .0
            .lock()
            .iter()
            .any(|e| matches!(e, RaftEvent::ConnectionFailed { address } if *address == addr)));
    }
}
