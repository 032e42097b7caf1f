//! Typed key/value operations over a shard's replicated engine.
//!
//! Writes are proposed under a [`Transaction`]; reads go through the host's
//! linearizable lookup and never touch the log. Error replies from the
//! engine surface as [`Error::Kv`].

use std::sync::Arc;
use std::time::Duration;

use quorumkv_proto::{
    AccountDescriptor, BucketDescriptor, KeyValue, KvRequest, KvResponse, ReplyPayload, ShardId,
    Transaction,
};

use crate::error::{Error, Result};
use crate::host::NodeHost;
use crate::txn::TransactionManager;

pub struct KvStore {
    txns: Arc<TransactionManager>,
    host: Arc<NodeHost>,
    timeout: Duration,
}

impl KvStore {
    pub fn new(txns: Arc<TransactionManager>, host: Arc<NodeHost>, timeout: Duration) -> Self {
        Self { txns, host, timeout }
    }

    pub async fn create_account(&self, txn: &Transaction, account_id: u64, owner: &str) -> Result<AccountDescriptor> {
        match self.write(txn, KvRequest::create_account(account_id, owner)).await? {
            ReplyPayload::Account(account) => Ok(account),
            other => Err(unexpected("create account", other)),
        }
    }

    pub async fn delete_account(&self, txn: &Transaction, account_id: u64, owner: &str) -> Result<()> {
        self.write_ack(txn, KvRequest::delete_account(account_id, owner), "delete account")
            .await
    }

    pub async fn create_bucket(
        &self,
        txn: &Transaction,
        account_id: u64,
        bucket: &str,
        owner: &str,
    ) -> Result<BucketDescriptor> {
        match self.write(txn, KvRequest::create_bucket(account_id, bucket, owner)).await? {
            ReplyPayload::Bucket(descriptor) => Ok(descriptor),
            other => Err(unexpected("create bucket", other)),
        }
    }

    pub async fn delete_bucket(&self, txn: &Transaction, account_id: u64, bucket: &str) -> Result<()> {
        self.write_ack(txn, KvRequest::delete_bucket(account_id, bucket), "delete bucket")
            .await
    }

    /// Write a key. `kv.version` must be one past the stored version, or 1
    /// for a new key. A zero `mod_revision` takes the proposal timestamp.
    pub async fn put_key(&self, txn: &Transaction, account_id: u64, bucket: &str, kv: KeyValue) -> Result<KeyValue> {
        match self.write(txn, KvRequest::put_key(account_id, bucket, kv)).await? {
            ReplyPayload::Key(stored) => Ok(stored),
            other => Err(unexpected("put key", other)),
        }
    }

    pub async fn delete_key(&self, txn: &Transaction, account_id: u64, bucket: &str, key: &[u8]) -> Result<()> {
        self.write_ack(txn, KvRequest::delete_key(account_id, bucket, key), "delete key")
            .await
    }

    pub async fn get_key(&self, shard_id: ShardId, account_id: u64, bucket: &str, key: &[u8]) -> Result<KeyValue> {
        let query = KvRequest::get_key(account_id, bucket, key).to_bytes()?;
        let bytes = self.host.read(shard_id, &query, self.timeout).await?;
        match decode_reply(&bytes)? {
            ReplyPayload::Key(kv) => Ok(kv),
            other => Err(unexpected("get key", other)),
        }
    }

    async fn write_ack(&self, txn: &Transaction, request: KvRequest, what: &str) -> Result<()> {
        match self.write(txn, request).await? {
            ReplyPayload::Ok => Ok(()),
            other => Err(unexpected(what, other)),
        }
    }

    /// Propose a request. The timestamp is stamped once here so that every
    /// replica applies the same descriptor and revision times.
    async fn write(&self, txn: &Transaction, mut request: KvRequest) -> Result<ReplyPayload> {
        request.stamp();
        let kind = request.kind;
        let result = self.txns.propose(txn, request.to_bytes()?, self.timeout).await?;
        if result.data.is_empty() {
            // Entry was skipped as already applied before a restart.
            return Err(Error::Rejected(format!("{kind:?} was already applied")));
        }
        tracing::trace!(shard_id = txn.shard_id, client_id = txn.client_id, ?kind, "write applied");
        decode_reply(&result.data)
    }
}

fn decode_reply(bytes: &[u8]) -> Result<ReplyPayload> {
    let reply = KvResponse::from_bytes(bytes)?;
    match reply.payload {
        ReplyPayload::Error { code, message } => Err(Error::Kv { code, message }),
        payload => Ok(payload),
    }
}

fn unexpected(what: &str, payload: ReplyPayload) -> Error {
    Error::Internal(format!("unexpected {what} reply {payload:?}"))
}
