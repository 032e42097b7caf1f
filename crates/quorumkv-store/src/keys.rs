//! Keyspace layout of the data tree.
//!
//! ```text
//! A | account_id (8, BE)                                  -> AccountDescriptor
//! B | account_id (8, BE) | bucket name                    -> BucketDescriptor
//! K | account_id (8, BE) | name len (2, BE) | name | key  -> KeyValue
//! ```
//!
//! Big-endian ids keep every account's sub-tree contiguous so prefix scans
//! cover exactly one account or one bucket. Bucket names are length-prefixed
//! in key entries so `logs` never prefixes `logs2`.

use crate::error::Error;

pub const ACCOUNT_TAG: u8 = b'A';
pub const BUCKET_TAG: u8 = b'B';
pub const KEY_TAG: u8 = b'K';

/// Longest bucket name that fits the two-byte length prefix.
pub const MAX_BUCKET_NAME: usize = u16::MAX as usize;

/// Key of an account descriptor.
pub fn account_key(account_id: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = ACCOUNT_TAG;
    key[1..].copy_from_slice(&account_id.to_be_bytes());
    key
}

/// Prefix of every bucket descriptor in an account.
pub fn bucket_prefix(account_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(BUCKET_TAG);
    key.extend_from_slice(&account_id.to_be_bytes());
    key
}

/// Key of a bucket descriptor.
pub fn bucket_key(account_id: u64, bucket: &str) -> Vec<u8> {
    let mut key = bucket_prefix(account_id);
    key.extend_from_slice(bucket.as_bytes());
    key
}

/// Prefix of every key entry in an account.
pub fn account_keys_prefix(account_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(KEY_TAG);
    key.extend_from_slice(&account_id.to_be_bytes());
    key
}

/// Prefix of every key entry in a bucket.
pub fn bucket_keys_prefix(account_id: u64, bucket: &str) -> Result<Vec<u8>, Error> {
    if bucket.len() > MAX_BUCKET_NAME {
        return Err(Error::InvalidBucketName(format!(
            "{} bytes, limit is {}",
            bucket.len(),
            MAX_BUCKET_NAME
        )));
    }
    let mut key = account_keys_prefix(account_id);
    key.extend_from_slice(&(bucket.len() as u16).to_be_bytes());
    key.extend_from_slice(bucket.as_bytes());
    Ok(key)
}

/// Key of a key entry.
pub fn entry_key(account_id: u64, bucket: &str, user_key: &[u8]) -> Result<Vec<u8>, Error> {
    let mut key = bucket_keys_prefix(account_id, bucket)?;
    key.extend_from_slice(user_key);
    Ok(key)
}
