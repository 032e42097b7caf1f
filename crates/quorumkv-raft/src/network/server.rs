//! Raft RPC server shared by every shard on a host.
//!
//! One REP socket is served through several nng contexts. Each context
//! carries one request at a time and hands it to a tokio task, so a shard
//! whose raft core is slow to answer ties up a single context while the
//! others keep serving the remaining shards.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use nng::{Aio, AioResult, Context, Message, Protocol, Socket};
use tokio::runtime::Handle;

use super::messages::{RaftReply, RaftRequest};
use crate::error::{Error, Result};
use crate::types::{ShardId, ShardRaft};

/// Running raft instances by shard, consulted for every incoming RPC.
pub type Router = Arc<DashMap<ShardId, ShardRaft>>;

/// Turns a decoded request into its reply.
type Dispatch = Arc<dyn Fn(RaftRequest) -> BoxFuture<'static, RaftReply> + Send + Sync>;

/// Contexts used when none are configured.
const DEFAULT_WORKERS: usize = 4;

/// Listens on a REP socket and dispatches each RPC to the raft instance of
/// the shard it names.
pub struct RaftServer {
    listen_addr: String,
    dispatch: Dispatch,
    workers: usize,
}

/// Handle to a running [`RaftServer`].
pub struct ServerHandle {
    socket: Option<Socket>,
    workers: Vec<(Context, Aio)>,
}

impl RaftServer {
    pub fn new(listen_addr: impl Into<String>, router: Router) -> Self {
        let handler: Dispatch = Arc::new(move |request: RaftRequest| -> BoxFuture<'static, RaftReply> {
            let router = router.clone();
            Box::pin(async move { dispatch(&router, request).await })
        });
        Self::with_dispatch(listen_addr, handler)
    }

    fn with_dispatch(listen_addr: impl Into<String>, dispatch: Dispatch) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            dispatch,
            workers: DEFAULT_WORKERS,
        }
    }

    /// Number of requests served concurrently. At least one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Bind the socket and start one receive per worker context.
    ///
    /// Binding happens before this returns, so an address in use is
    /// reported to the caller. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<ServerHandle> {
        let socket =
            Socket::new(Protocol::Rep0).map_err(|e| Error::Network(format!("failed to create socket: {e}")))?;
        let url = format!("tcp://{}", self.listen_addr);
        socket
            .listen(&url)
            .map_err(|e| Error::Network(format!("failed to listen on {url}: {e}")))?;

        let runtime = Handle::current();
        let mut handle = ServerHandle {
            socket: Some(socket.clone()),
            workers: Vec::with_capacity(self.workers),
        };
        for worker_id in 0..self.workers {
            match start_worker(&socket, worker_id, self.dispatch.clone(), runtime.clone()) {
                Ok(worker) => handle.workers.push(worker),
                Err(e) => {
                    handle.close();
                    return Err(e);
                }
            }
        }
        tracing::info!(addr = %url, workers = self.workers, "raft server listening");
        Ok(handle)
    }
}

impl ServerHandle {
    /// Stop accepting RPCs. Replies still in flight are dropped.
    pub async fn stop(&mut self) {
        self.close();
        let workers = std::mem::take(&mut self.workers);
        // Dropping an Aio waits for its callback, which must not happen on
        // a runtime thread.
        if let Err(e) = tokio::task::spawn_blocking(move || drop(workers)).await {
            tracing::warn!(error = %e, "raft server workers failed to stop");
        }
        tracing::info!("raft server stopped");
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        for (ctx, aio) in &self.workers {
            aio.cancel();
            ctx.close();
        }
    }
}

fn start_worker(socket: &Socket, worker_id: usize, dispatch: Dispatch, runtime: Handle) -> Result<(Context, Aio)> {
    let ctx = Context::new(socket).map_err(|e| Error::Network(format!("failed to create context: {e}")))?;
    let callback_ctx = ctx.clone();
    let aio = Aio::new(move |aio, result| on_event(worker_id, &callback_ctx, aio, result, &dispatch, &runtime))
        .map_err(|e| Error::Network(format!("failed to create aio: {e}")))?;
    ctx.recv(&aio)
        .map_err(|e| Error::Network(format!("failed to start receiving: {e}")))?;
    Ok((ctx, aio))
}

/// Completion callback of one worker context. It runs on an nng thread and
/// must not panic or block.
fn on_event(worker_id: usize, ctx: &Context, aio: Aio, result: AioResult, dispatch: &Dispatch, runtime: &Handle) {
    match result {
        AioResult::Recv(Ok(message)) => {
            let request = match RaftRequest::decode(message.as_slice()) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "malformed raft rpc");
                    reply(worker_id, ctx, &aio, RaftReply::Malformed(e.to_string()));
                    return;
                }
            };
            let reply_future = dispatch(request);
            let ctx = ctx.clone();
            runtime.spawn(async move {
                let response = reply_future.await;
                reply(worker_id, &ctx, &aio, response);
            });
        }
        AioResult::Recv(Err(nng::Error::Closed)) | AioResult::Recv(Err(nng::Error::Canceled)) => {
            tracing::debug!(worker_id, "raft rpc worker closed");
        }
        AioResult::Recv(Err(e)) => {
            tracing::error!(worker_id, error = %e, "failed to receive raft rpc");
            rearm(worker_id, ctx, &aio);
        }
        AioResult::Send(Ok(())) => rearm(worker_id, ctx, &aio),
        AioResult::Send(Err((_, nng::Error::Closed))) => {}
        AioResult::Send(Err((_, e))) => {
            tracing::warn!(worker_id, error = %e, "failed to send raft reply");
            rearm(worker_id, ctx, &aio);
        }
        AioResult::Sleep(_) => {}
    }
}

fn reply(worker_id: usize, ctx: &Context, aio: &Aio, response: RaftReply) {
    let bytes = match response.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(worker_id, error = %e, "failed to encode raft reply");
            // Answer anyway so the context is not left waiting on a send.
            match RaftReply::Malformed(format!("reply could not be encoded: {e}")).encode() {
                Ok(bytes) => bytes,
                Err(_) => return rearm(worker_id, ctx, aio),
            }
        }
    };
    if let Err((_, e)) = ctx.send(aio, Message::from(bytes.as_slice())) {
        tracing::warn!(worker_id, error = %e, "failed to queue raft reply");
        rearm(worker_id, ctx, aio);
    }
}

fn rearm(worker_id: usize, ctx: &Context, aio: &Aio) {
    if let Err(e) = ctx.recv(aio) {
        tracing::debug!(worker_id, error = %e, "raft rpc worker not rearmed");
    }
}

async fn dispatch(router: &Router, request: RaftRequest) -> RaftReply {
    let shard_id = request.shard_id();
    // Clone out of the map so no shard lock is held across the await.
    let Some(raft) = router.get(&shard_id).map(|r| r.value().clone()) else {
        tracing::debug!(shard_id, rpc = request.name(), "rpc for a shard not hosted here");
        return RaftReply::ShardNotFound(shard_id);
    };

    match request {
        RaftRequest::Vote { rpc, .. } => RaftReply::Vote(raft.vote(rpc).await),
        RaftRequest::AppendEntries { rpc, .. } => RaftReply::AppendEntries(raft.append_entries(rpc).await),
        RaftRequest::InstallSnapshot { rpc, .. } => RaftReply::InstallSnapshot(raft.install_snapshot(rpc).await),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use nng::options::{Options, RecvTimeout};
    use openraft::raft::VoteRequest;
    use openraft::Vote;

    use super::*;

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    fn vote(shard_id: ShardId) -> Vec<u8> {
        RaftRequest::Vote {
            shard_id,
            rpc: VoteRequest::new(Vote::new(1, 1), None),
        }
        .encode()
        .unwrap()
    }

    /// Send one request on a fresh REQ socket and wait for the reply.
    fn call(addr: &str, payload: Vec<u8>, timeout: Duration) -> nng::Result<Vec<u8>> {
        let socket = Socket::new(Protocol::Req0)?;
        socket.set_opt::<RecvTimeout>(Some(timeout))?;
        socket.dial(&format!("tcp://{addr}"))?;
        socket.send(payload.as_slice()).map_err(|(_, e)| e)?;
        Ok(socket.recv()?.as_slice().to_vec())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_shard_is_reported() {
        let addr = free_addr();
        let mut handle = RaftServer::new(addr.clone(), Arc::new(DashMap::new())).start().unwrap();

        let bytes = tokio::task::spawn_blocking(move || call(&addr, vote(77), Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(RaftReply::decode(&bytes).unwrap(), RaftReply::ShardNotFound(77)));
        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_shard_does_not_block_others() {
        let addr = free_addr();
        let dispatch: Dispatch = Arc::new(|request: RaftRequest| -> BoxFuture<'static, RaftReply> {
            Box::pin(async move {
                let shard_id = request.shard_id();
                if shard_id == 1 {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                RaftReply::ShardNotFound(shard_id)
            })
        });
        let mut handle = RaftServer::with_dispatch(addr.clone(), dispatch)
            .with_workers(2)
            .start()
            .unwrap();

        let slow_addr = addr.clone();
        let slow = tokio::task::spawn_blocking(move || call(&slow_addr, vote(1), Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let fast = tokio::task::spawn_blocking(move || call(&addr, vote(2), Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(RaftReply::decode(&fast).unwrap(), RaftReply::ShardNotFound(2)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let slow = slow.await.unwrap().unwrap();
        assert!(matches!(RaftReply::decode(&slow).unwrap(), RaftReply::ShardNotFound(1)));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_address_in_use_is_reported() {
        let addr = free_addr();
        let mut first = RaftServer::new(addr.clone(), Arc::new(DashMap::new())).start().unwrap();
        assert!(RaftServer::new(addr, Arc::new(DashMap::new())).start().is_err());
        first.stop().await;
    }
}
