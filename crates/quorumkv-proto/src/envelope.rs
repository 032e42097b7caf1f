//! Command envelope carried by the replicated log.
//!
//! A request and its reply travel in one envelope shape: a kind tag, the
//! account id, the bucket name and a one-of payload matching the kind. The
//! same bytes must decode identically on every replica, so the envelope is
//! encoded with rkyv only.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

use crate::error::Error;
use crate::model::{current_millis, AccountDescriptor, BucketDescriptor, KeyValue};
use crate::ENVELOPE_VERSION;

/// Request kinds that may appear in a command envelope.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum RequestKind {
    CreateAccount,
    DeleteAccount,
    CreateBucket,
    DeleteBucket,
    GetKey,
    PutKey,
    DeleteKey,
}

impl RequestKind {
    /// The reply kind paired with this request kind.
    pub fn reply_kind(self) -> ReplyKind {
        match self {
            RequestKind::CreateAccount => ReplyKind::CreateAccountReply,
            RequestKind::DeleteAccount => ReplyKind::DeleteAccountReply,
            RequestKind::CreateBucket => ReplyKind::CreateBucketReply,
            RequestKind::DeleteBucket => ReplyKind::DeleteBucketReply,
            RequestKind::GetKey => ReplyKind::GetKeyReply,
            RequestKind::PutKey => ReplyKind::PutKeyReply,
            RequestKind::DeleteKey => ReplyKind::DeleteKeyReply,
        }
    }

    /// Whether this kind goes through the replicated log.
    pub fn is_write(self) -> bool {
        !matches!(self, RequestKind::GetKey)
    }
}

/// Reply kinds, one per request kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum ReplyKind {
    CreateAccountReply,
    DeleteAccountReply,
    CreateBucketReply,
    DeleteBucketReply,
    GetKeyReply,
    PutKeyReply,
    DeleteKeyReply,
}

/// Request payloads.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum RequestPayload {
    CreateAccount { owner: String },
    DeleteAccount { owner: String },
    CreateBucket { owner: String },
    DeleteBucket,
    GetKey { key: Vec<u8> },
    PutKey { kv: KeyValue },
    DeleteKey { key: Vec<u8> },
}

impl RequestPayload {
    /// The request kind this payload belongs to.
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::CreateAccount { .. } => RequestKind::CreateAccount,
            RequestPayload::DeleteAccount { .. } => RequestKind::DeleteAccount,
            RequestPayload::CreateBucket { .. } => RequestKind::CreateBucket,
            RequestPayload::DeleteBucket => RequestKind::DeleteBucket,
            RequestPayload::GetKey { .. } => RequestKind::GetKey,
            RequestPayload::PutKey { .. } => RequestKind::PutKey,
            RequestPayload::DeleteKey { .. } => RequestKind::DeleteKey,
        }
    }
}

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct KvRequest {
    /// Envelope version.
    pub version: u32,
    /// Kind discriminator.
    pub kind: RequestKind,
    /// Target account.
    pub account_id: u64,
    /// Target bucket; empty for account-level requests.
    pub bucket: String,
    /// Kind-specific payload.
    pub payload: RequestPayload,
    /// Millis stamped by the proposer; zero until stamped. Every replica
    /// applies descriptor and revision times from this value only.
    pub timestamp: u64,
}

impl KvRequest {
    fn with_payload(account_id: u64, bucket: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: payload.kind(),
            account_id,
            bucket: bucket.into(),
            payload,
            timestamp: 0,
        }
    }

    /// Set the proposal timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Stamp the current time unless a timestamp is already set.
    pub fn stamp(&mut self) {
        if self.timestamp == 0 {
            self.timestamp = current_millis();
        }
    }

    /// Create an account.
    pub fn create_account(account_id: u64, owner: impl Into<String>) -> Self {
        Self::with_payload(account_id, "", RequestPayload::CreateAccount { owner: owner.into() })
    }

    /// Delete an account.
    pub fn delete_account(account_id: u64, owner: impl Into<String>) -> Self {
        Self::with_payload(account_id, "", RequestPayload::DeleteAccount { owner: owner.into() })
    }

    /// Create a bucket in an account.
    pub fn create_bucket(account_id: u64, bucket: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::with_payload(account_id, bucket, RequestPayload::CreateBucket { owner: owner.into() })
    }

    /// Delete a bucket from an account.
    pub fn delete_bucket(account_id: u64, bucket: impl Into<String>) -> Self {
        Self::with_payload(account_id, bucket, RequestPayload::DeleteBucket)
    }

    /// Read a key.
    pub fn get_key(account_id: u64, bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self::with_payload(account_id, bucket, RequestPayload::GetKey { key: key.into() })
    }

    /// Write a key.
    pub fn put_key(account_id: u64, bucket: impl Into<String>, kv: KeyValue) -> Self {
        Self::with_payload(account_id, bucket, RequestPayload::PutKey { kv })
    }

    /// Delete a key.
    pub fn delete_key(account_id: u64, bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self::with_payload(account_id, bucket, RequestPayload::DeleteKey { key: key.into() })
    }

    /// Check the version stamp and that the kind tag matches the payload.
    pub fn validate(&self) -> Result<(), Error> {
        if self.version != ENVELOPE_VERSION {
            return Err(Error::VersionMismatch {
                expected: ENVELOPE_VERSION,
                actual: self.version,
            });
        }
        if self.kind != self.payload.kind() {
            return Err(Error::InvalidMessage(format!(
                "kind {:?} does not match payload {:?}",
                self.kind,
                self.payload.kind()
            )));
        }
        Ok(())
    }

    /// Decode and validate a request envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let request = Self::from_bytes(bytes)?;
        request.validate()?;
        Ok(request)
    }
}

impl_rkyv_codec!(KvRequest);

/// Reply payloads.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum ReplyPayload {
    /// Account descriptor after a create.
    Account(AccountDescriptor),
    /// Bucket descriptor after a create.
    Bucket(BucketDescriptor),
    /// A stored key/value pair.
    Key(KeyValue),
    /// Acknowledgement of a delete or put.
    Ok,
    /// The request failed; see [`error_codes`].
    Error { code: u32, message: String },
}

/// A reply envelope.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct KvResponse {
    /// Envelope version.
    pub version: u32,
    /// Kind discriminator.
    pub kind: ReplyKind,
    /// Account the request targeted.
    pub account_id: u64,
    /// Bucket the request targeted.
    pub bucket: String,
    /// Kind-specific payload.
    pub payload: ReplyPayload,
}

impl KvResponse {
    /// Create a reply for a request.
    pub fn reply_to(request: &KvRequest, payload: ReplyPayload) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: request.kind.reply_kind(),
            account_id: request.account_id,
            bucket: request.bucket.clone(),
            payload,
        }
    }

    /// Create an error reply for a request.
    pub fn error(request: &KvRequest, code: u32, message: impl Into<String>) -> Self {
        Self::reply_to(
            request,
            ReplyPayload::Error {
                code,
                message: message.into(),
            },
        )
    }

    /// Check if this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ReplyPayload::Error { .. })
    }

    /// Error code, if this is an error reply.
    pub fn error_code(&self) -> Option<u32> {
        match &self.payload {
            ReplyPayload::Error { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl_rkyv_codec!(KvResponse);

/// Error codes carried by [`ReplyPayload::Error`].
pub mod error_codes {
    /// Unknown/internal error.
    pub const INTERNAL: u32 = 1;
    /// Malformed request.
    pub const INVALID_REQUEST: u32 = 2;
    /// Account id is zero.
    pub const INVALID_ACCOUNT: u32 = 3;
    /// Owner is empty.
    pub const INVALID_OWNER: u32 = 4;
    /// Account does not exist.
    pub const MISSING_ACCOUNT: u32 = 5;
    /// Bucket does not exist.
    pub const MISSING_BUCKET: u32 = 6;
    /// Bucket already exists.
    pub const BUCKET_EXISTS: u32 = 7;
    /// Key does not exist.
    pub const KEY_NOT_FOUND: u32 = 8;
    /// Compare-and-swap version mismatch.
    pub const VERSION_CONFLICT: u32 = 9;
    /// Kind not allowed on this path.
    pub const UNSUPPORTED_METHOD: u32 = 10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_tag_kind() {
        let request = KvRequest::create_bucket(42, "logs", "a@b.com");
        assert_eq!(request.kind, RequestKind::CreateBucket);
        assert_eq!(request.bucket, "logs");
        assert!(request.validate().is_ok());
        assert_eq!(request.kind.reply_kind(), ReplyKind::CreateBucketReply);
    }

    #[test]
    fn test_kind_payload_mismatch_rejected() {
        let mut request = KvRequest::delete_key(42, "logs", "k");
        request.kind = RequestKind::PutKey;
        let bytes = request.to_bytes().unwrap();
        assert!(matches!(KvRequest::decode(&bytes), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut request = KvRequest::get_key(42, "logs", "k");
        request.version = ENVELOPE_VERSION + 1;
        let bytes = request.to_bytes().unwrap();
        assert!(matches!(
            KvRequest::decode(&bytes),
            Err(Error::VersionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_error_reply() {
        let request = KvRequest::get_key(42, "logs", "missing");
        let reply = KvResponse::error(&request, error_codes::KEY_NOT_FOUND, "key not found");
        assert!(reply.is_error());
        assert_eq!(reply.error_code(), Some(error_codes::KEY_NOT_FOUND));
        assert_eq!(reply.kind, ReplyKind::GetKeyReply);

        let decoded = KvResponse::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_stamp_keeps_existing_timestamp() {
        let mut request = KvRequest::create_account(42, "a@b.com");
        assert_eq!(request.timestamp, 0);
        request.stamp();
        assert!(request.timestamp > 0);

        let mut fixed = KvRequest::create_account(42, "a@b.com").with_timestamp(1234);
        fixed.stamp();
        assert_eq!(fixed.timestamp, 1234);
        let decoded = KvRequest::decode(&fixed.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.timestamp, 1234);
    }

    #[test]
    fn test_only_get_key_is_read() {
        assert!(!RequestKind::GetKey.is_write());
        assert!(RequestKind::PutKey.is_write());
        assert!(RequestKind::DeleteAccount.is_write());
    }
}
