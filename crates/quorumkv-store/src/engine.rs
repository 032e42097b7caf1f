//! Storage engine implementation.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use quorumkv_proto::{
    current_millis, AccountDescriptor, BucketDescriptor, KeyValue, KvRequest, KvResponse, ReplyPayload,
    RequestPayload,
};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, IVec, Transactional, Tree};

use crate::config::StoreConfig;
use crate::error::Error;
use crate::keys;
use crate::snapshot::{ImageEntry, StoreImage};

/// Tree name for accounts, buckets and keys.
const DATA_TREE: &str = "data";

/// Tree name for engine metadata.
const META_TREE: &str = "meta";

/// Meta key of the highest applied replicated-log index.
const MONOTONIC_LOG_INDEX: &[u8] = b"monotonic_log_index";

type TxResult<T> = Result<T, ConflictableTransactionError<Error>>;

fn abort(e: impl Into<Error>) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(e.into())
}

/// The account/bucket/key store of one replica.
///
/// Every mutation holds `writer` from its subtree scan through its commit, so
/// no key can appear under a bucket or account between the scan and the
/// transaction that deletes it.
pub struct KvEngine {
    db: Db,
    data_tree: Tree,
    meta_tree: Tree,
    path: PathBuf,
    writer: Mutex<()>,
}

impl KvEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StoreConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let data_tree = db.open_tree(DATA_TREE)?;
        let meta_tree = db.open_tree(META_TREE)?;

        tracing::debug!(path = %config.path.display(), "opened kv store");

        Ok(Self {
            db,
            data_tree,
            meta_tree,
            path: config.path,
            writer: Mutex::new(()),
        })
    }

    /// Directory backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    // ========== Accounts and buckets ==========

    // The direct API stamps the local clock; replicated writes go through
    // `apply` and use the request's timestamp instead.

    /// Create an account. Creating an existing account returns it unchanged.
    pub fn create_account_bucket(&self, account_id: u64, owner: &str) -> Result<AccountDescriptor, Error> {
        let _writer = self.writer.lock();
        let now = current_millis();
        self.write(None, |tx| create_account_tx(tx, account_id, owner, now))
    }

    /// Delete an account together with every bucket and key under it.
    pub fn delete_account_bucket(&self, account_id: u64, owner: &str) -> Result<(), Error> {
        let _writer = self.writer.lock();
        let subtree = self.account_subtree(account_id)?;
        self.write(None, |tx| delete_account_tx(tx, account_id, owner, &subtree))
    }

    /// Create a bucket inside an existing account.
    pub fn create_bucket(&self, account_id: u64, name: &str, owner: &str) -> Result<BucketDescriptor, Error> {
        let _writer = self.writer.lock();
        let now = current_millis();
        self.write(None, |tx| create_bucket_tx(tx, account_id, name, owner, now))
    }

    /// Delete a bucket and every key in it.
    pub fn delete_bucket(&self, account_id: u64, name: &str) -> Result<(), Error> {
        let _writer = self.writer.lock();
        let now = current_millis();
        let subtree = self.bucket_subtree(account_id, name)?;
        self.write(None, |tx| delete_bucket_tx(tx, account_id, name, &subtree, now))
    }

    /// Get an account descriptor.
    pub fn get_account(&self, account_id: u64) -> Result<Option<AccountDescriptor>, Error> {
        match self.data_tree.get(&keys::account_key(account_id)[..])? {
            Some(bytes) => Ok(Some(AccountDescriptor::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a bucket descriptor.
    pub fn get_bucket(&self, account_id: u64, name: &str) -> Result<Option<BucketDescriptor>, Error> {
        match self.data_tree.get(keys::bucket_key(account_id, name))? {
            Some(bytes) => Ok(Some(BucketDescriptor::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    // ========== Keys ==========

    /// Read a key.
    pub fn get_key(&self, account_id: u64, bucket: &str, key: &[u8]) -> Result<KeyValue, Error> {
        if account_id == 0 {
            return Err(Error::InvalidAccount);
        }
        if self.data_tree.get(keys::bucket_key(account_id, bucket))?.is_none() {
            return Err(Error::MissingBucket {
                account_id,
                bucket: bucket.to_string(),
            });
        }
        match self.data_tree.get(keys::entry_key(account_id, bucket, key)?)? {
            Some(bytes) => Ok(KeyValue::from_bytes(&bytes)?),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Write a key under the compare-and-swap rule: a new key must carry
    /// version 1, an existing key must carry its stored version plus one.
    pub fn put_key(&self, account_id: u64, bucket: &str, kv: &KeyValue) -> Result<KeyValue, Error> {
        let _writer = self.writer.lock();
        let now = current_millis();
        self.write(None, |tx| put_key_tx(tx, account_id, bucket, kv, now))
    }

    /// Delete a key.
    pub fn delete_key(&self, account_id: u64, bucket: &str, key: &[u8]) -> Result<(), Error> {
        let _writer = self.writer.lock();
        let now = current_millis();
        self.write(None, |tx| delete_key_tx(tx, account_id, bucket, key, now))
    }

    /// List every key in a bucket, in key order.
    pub fn list_keys(&self, account_id: u64, bucket: &str) -> Result<Vec<KeyValue>, Error> {
        let prefix = keys::bucket_keys_prefix(account_id, bucket)?;
        self.data_tree
            .scan_prefix(prefix)
            .values()
            .map(|value| -> Result<KeyValue, Error> { Ok(KeyValue::from_bytes(&value?)?) })
            .collect()
    }

    // ========== Replicated log integration ==========

    /// Apply one replicated command at `index`.
    ///
    /// The command's effects and the new monotonic log index commit in one
    /// transaction. Request errors (missing account, CAS conflict, ...) leave
    /// the data untouched, still advance the index, and come back as an
    /// error reply. Only storage failures are returned as `Err`.
    ///
    /// Times written to descriptors and revisions come from
    /// `request.timestamp`, never from the local clock.
    pub fn apply(&self, index: u64, request: &KvRequest) -> Result<KvResponse, Error> {
        let _writer = self.writer.lock();
        let outcome = match request.validate() {
            Ok(()) => self.execute(index, request),
            Err(e) => Err(Error::Protocol(e)),
        };

        match outcome {
            Ok(payload) => Ok(KvResponse::reply_to(request, payload)),
            Err(e) if e.is_request_error() => {
                tracing::debug!(index, kind = ?request.kind, error = %e, "command rejected");
                self.write(Some(index), |_| Ok(()))?;
                Ok(KvResponse::error(request, e.code(), e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn execute(&self, index: u64, request: &KvRequest) -> Result<ReplyPayload, Error> {
        let account_id = request.account_id;
        let bucket = request.bucket.as_str();
        let index = Some(index);
        let now = request.timestamp;

        match &request.payload {
            RequestPayload::CreateAccount { owner } => self
                .write(index, |tx| create_account_tx(tx, account_id, owner, now))
                .map(ReplyPayload::Account),
            RequestPayload::DeleteAccount { owner } => {
                let subtree = self.account_subtree(account_id)?;
                self.write(index, |tx| delete_account_tx(tx, account_id, owner, &subtree))
                    .map(|()| ReplyPayload::Ok)
            }
            RequestPayload::CreateBucket { owner } => self
                .write(index, |tx| create_bucket_tx(tx, account_id, bucket, owner, now))
                .map(ReplyPayload::Bucket),
            RequestPayload::DeleteBucket => {
                let subtree = self.bucket_subtree(account_id, bucket)?;
                self.write(index, |tx| delete_bucket_tx(tx, account_id, bucket, &subtree, now))
                    .map(|()| ReplyPayload::Ok)
            }
            RequestPayload::PutKey { kv } => self
                .write(index, |tx| put_key_tx(tx, account_id, bucket, kv, now))
                .map(ReplyPayload::Key),
            RequestPayload::DeleteKey { key } => self
                .write(index, |tx| delete_key_tx(tx, account_id, bucket, key, now))
                .map(|()| ReplyPayload::Ok),
            RequestPayload::GetKey { .. } => Err(Error::UnsupportedMethod(
                "GetKey is served by lookup, not by the log".to_string(),
            )),
        }
    }

    /// Serve a read-only query. Only `GetKey` is legal here.
    pub fn lookup(&self, request: &KvRequest) -> Result<KvResponse, Error> {
        request.validate()?;
        match &request.payload {
            RequestPayload::GetKey { key } => {
                match self.get_key(request.account_id, &request.bucket, key) {
                    Ok(kv) => Ok(KvResponse::reply_to(request, ReplyPayload::Key(kv))),
                    Err(e) if e.is_request_error() => Ok(KvResponse::error(request, e.code(), e.to_string())),
                    Err(e) => Err(e),
                }
            }
            _ => Err(Error::UnsupportedMethod(format!(
                "{:?} cannot be served by lookup",
                request.kind
            ))),
        }
    }

    /// Highest replicated-log index durably applied, 0 for a fresh store.
    pub fn get_monotonic_log_index(&self) -> Result<u64, Error> {
        match self.meta_tree.get(MONOTONIC_LOG_INDEX)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Record `index` as applied.
    pub fn update_monotonic_log(&self, index: u64) -> Result<(), Error> {
        let _writer = self.writer.lock();
        self.write(Some(index), |_| Ok(()))
    }

    // ========== Snapshots ==========

    /// Capture every data-tree pair and the monotonic index.
    pub fn snapshot(&self) -> Result<StoreImage, Error> {
        let _writer = self.writer.lock();
        let index = self.get_monotonic_log_index()?;
        let entries = self
            .data_tree
            .iter()
            .map(|item| -> Result<ImageEntry, Error> {
                let (key, value) = item?;
                Ok(ImageEntry {
                    key: key.to_vec(),
                    value: value.to_vec(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(StoreImage { index, entries })
    }

    /// Replace the whole contents of the store with an image.
    pub fn restore(&self, image: &StoreImage) -> Result<(), Error> {
        let _writer = self.writer.lock();
        self.data_tree.clear()?;
        self.meta_tree.clear()?;

        let mut batch = sled::Batch::default();
        for entry in &image.entries {
            batch.insert(entry.key.as_slice(), entry.value.as_slice());
        }
        self.data_tree.apply_batch(batch)?;
        self.meta_tree
            .insert(MONOTONIC_LOG_INDEX, &image.index.to_be_bytes()[..])?;
        self.flush()?;

        tracing::debug!(index = image.index, entries = image.len(), "restored kv store from image");
        Ok(())
    }

    // ========== Maintenance ==========

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the approximate size of the database on disk.
    pub fn size_on_disk(&self) -> Result<u64, Error> {
        Ok(self.db.size_on_disk()?)
    }

    /// Run `op` over the data tree in one transaction, recording `index`
    /// in the meta tree when given.
    fn write<T>(&self, index: Option<u64>, op: impl Fn(&TransactionalTree) -> TxResult<T>) -> Result<T, Error> {
        let result: Result<T, TransactionError<Error>> =
            (&self.data_tree, &self.meta_tree).transaction(|(data_tx, meta_tx)| {
                let out = op(data_tx)?;
                if let Some(index) = index {
                    meta_tx.insert(MONOTONIC_LOG_INDEX, &index.to_be_bytes()[..])?;
                }
                Ok(out)
            });

        match result {
            Ok(out) => Ok(out),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    fn account_subtree(&self, account_id: u64) -> Result<Vec<IVec>, Error> {
        let mut subtree = self.scan_keys(keys::bucket_prefix(account_id))?;
        subtree.extend(self.scan_keys(keys::account_keys_prefix(account_id))?);
        Ok(subtree)
    }

    fn bucket_subtree(&self, account_id: u64, bucket: &str) -> Result<Vec<IVec>, Error> {
        self.scan_keys(keys::bucket_keys_prefix(account_id, bucket)?)
    }

    fn scan_keys(&self, prefix: Vec<u8>) -> Result<Vec<IVec>, Error> {
        Ok(self.data_tree.scan_prefix(prefix).keys().collect::<Result<Vec<_>, _>>()?)
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, Error> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::InvalidData(format!("expected 8 bytes, found {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn validate_account(account_id: u64, owner: Option<&str>) -> TxResult<()> {
    if account_id == 0 {
        return Err(abort(Error::InvalidAccount));
    }
    if owner.is_some_and(str::is_empty) {
        return Err(abort(Error::InvalidOwner));
    }
    Ok(())
}

fn load_account(tx: &TransactionalTree, account_id: u64) -> TxResult<AccountDescriptor> {
    match tx.get(&keys::account_key(account_id)[..])? {
        Some(bytes) => AccountDescriptor::from_bytes(&bytes).map_err(abort),
        None => Err(abort(Error::MissingAccountBucket(account_id))),
    }
}

fn store_account(tx: &TransactionalTree, account: &AccountDescriptor) -> TxResult<()> {
    let bytes = account.to_bytes().map_err(abort)?;
    tx.insert(&keys::account_key(account.account_id)[..], bytes)?;
    Ok(())
}

fn load_bucket(tx: &TransactionalTree, account_id: u64, bucket: &str) -> TxResult<BucketDescriptor> {
    match tx.get(keys::bucket_key(account_id, bucket))? {
        Some(bytes) => BucketDescriptor::from_bytes(&bytes).map_err(abort),
        None => Err(abort(Error::MissingBucket {
            account_id,
            bucket: bucket.to_string(),
        })),
    }
}

fn store_bucket(tx: &TransactionalTree, account_id: u64, bucket: &BucketDescriptor) -> TxResult<()> {
    let bytes = bucket.to_bytes().map_err(abort)?;
    tx.insert(keys::bucket_key(account_id, &bucket.name), bytes)?;
    Ok(())
}

fn create_account_tx(tx: &TransactionalTree, account_id: u64, owner: &str, now: u64) -> TxResult<AccountDescriptor> {
    validate_account(account_id, Some(owner))?;
    if let Some(bytes) = tx.get(&keys::account_key(account_id)[..])? {
        return AccountDescriptor::from_bytes(&bytes).map_err(abort);
    }
    let account = AccountDescriptor::new(account_id, owner, now);
    store_account(tx, &account)?;
    Ok(account)
}

fn delete_account_tx(tx: &TransactionalTree, account_id: u64, owner: &str, subtree: &[IVec]) -> TxResult<()> {
    validate_account(account_id, Some(owner))?;
    load_account(tx, account_id)?;
    for key in subtree {
        tx.remove(key.clone())?;
    }
    tx.remove(&keys::account_key(account_id)[..])?;
    Ok(())
}

fn create_bucket_tx(
    tx: &TransactionalTree,
    account_id: u64,
    name: &str,
    owner: &str,
    now: u64,
) -> TxResult<BucketDescriptor> {
    validate_account(account_id, Some(owner))?;
    if name.is_empty() {
        return Err(abort(Error::InvalidBucketName("empty".to_string())));
    }
    // Rejects over-long names before anything is written.
    keys::bucket_keys_prefix(account_id, name).map_err(abort)?;

    let mut account = load_account(tx, account_id)?;
    if tx.get(keys::bucket_key(account_id, name))?.is_some() {
        return Err(abort(Error::BucketExists {
            account_id,
            bucket: name.to_string(),
        }));
    }

    let bucket = BucketDescriptor::new(name, owner, now);
    account.add_bucket(name, now);
    store_bucket(tx, account_id, &bucket)?;
    store_account(tx, &account)?;
    Ok(bucket)
}

fn delete_bucket_tx(tx: &TransactionalTree, account_id: u64, name: &str, subtree: &[IVec], now: u64) -> TxResult<()> {
    validate_account(account_id, None)?;
    let mut account = load_account(tx, account_id)?;
    load_bucket(tx, account_id, name)?;

    for key in subtree {
        tx.remove(key.clone())?;
    }
    tx.remove(keys::bucket_key(account_id, name))?;
    account.remove_bucket(name, now);
    store_account(tx, &account)?;
    Ok(())
}

fn put_key_tx(tx: &TransactionalTree, account_id: u64, bucket: &str, kv: &KeyValue, now: u64) -> TxResult<KeyValue> {
    validate_account(account_id, None)?;
    let mut descriptor = load_bucket(tx, account_id, bucket)?;
    let entry = keys::entry_key(account_id, bucket, &kv.key).map_err(abort)?;

    let raw = tx.get(entry.as_slice())?;
    let current = match &raw {
        Some(bytes) => match KeyValue::from_bytes(bytes) {
            Ok(current) => Some(current),
            Err(e) => {
                tracing::warn!(account_id, bucket, key = %kv.key_str(), error = %e, "overwriting undecodable value");
                None
            }
        },
        None => None,
    };

    let mut stored = kv.clone();
    if stored.mod_revision == 0 {
        stored.mod_revision = now;
    }

    match (&raw, &current) {
        (_, Some(current)) => {
            // A key already at u64::MAX cannot advance.
            if current.version.checked_add(1) != Some(kv.version) {
                return Err(abort(Error::VersionConflict {
                    current: current.version,
                    proposed: kv.version,
                }));
            }
            stored.create_revision = current.create_revision;
            descriptor.size = descriptor.size.saturating_sub(current.value.len() as u64);
        }
        // Undecodable value: any version replaces it.
        (Some(_), None) => {
            if stored.create_revision == 0 {
                stored.create_revision = stored.mod_revision;
            }
        }
        (None, None) => {
            if kv.version != 1 {
                return Err(abort(Error::VersionConflict {
                    current: 0,
                    proposed: kv.version,
                }));
            }
            if stored.create_revision == 0 {
                stored.create_revision = stored.mod_revision;
            }
            descriptor.key_count += 1;
        }
    }
    descriptor.size += stored.value.len() as u64;
    descriptor.last_updated = now;

    let bytes = stored.to_bytes().map_err(abort)?;
    tx.insert(entry, bytes)?;
    store_bucket(tx, account_id, &descriptor)?;
    Ok(stored)
}

fn delete_key_tx(tx: &TransactionalTree, account_id: u64, bucket: &str, key: &[u8], now: u64) -> TxResult<()> {
    validate_account(account_id, None)?;
    let mut descriptor = load_bucket(tx, account_id, bucket)?;
    let entry = keys::entry_key(account_id, bucket, key).map_err(abort)?;

    let removed = match tx.remove(entry)? {
        Some(bytes) => bytes,
        None => return Err(abort(Error::KeyNotFound)),
    };
    let freed = KeyValue::from_bytes(&removed)
        .map(|kv| kv.value.len() as u64)
        .unwrap_or(0);

    descriptor.key_count = descriptor.key_count.saturating_sub(1);
    descriptor.size = descriptor.size.saturating_sub(freed);
    descriptor.last_updated = now;
    store_bucket(tx, account_id, &descriptor)?;
    Ok(())
}
