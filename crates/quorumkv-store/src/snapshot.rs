//! Point-in-time image of a store, used for snapshot transfer.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::Error;

/// One raw data-tree pair.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct ImageEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Every data-tree pair of a store plus its monotonic log index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct StoreImage {
    /// Highest log index applied when the image was taken.
    pub index: u64,
    /// Data-tree pairs in key order.
    pub entries: Vec<ImageEntry>,
}

impl StoreImage {
    /// Serialize to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::InvalidData(format!("failed to encode store image: {e}")))
    }

    /// Deserialize from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::InvalidData(format!("failed to decode store image: {e}")))
    }

    /// Number of data-tree pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
