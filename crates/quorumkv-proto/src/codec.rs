//! rkyv encoding helpers shared by the envelope and the data model.

/// Implements `to_bytes`/`from_bytes` for an rkyv-archivable type.
///
/// Decoding copies the input into an aligned buffer first: bytes handed to
/// us by sled or the raft log carry no alignment guarantee.
macro_rules! impl_rkyv_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to bytes using rkyv.
            pub fn to_bytes(&self) -> Result<Vec<u8>, $crate::Error> {
                rkyv::to_bytes::<rkyv::rancor::Error>(self)
                    .map(|v| v.to_vec())
                    .map_err(|e| $crate::Error::Serialization(e.to_string()))
            }

            /// Deserialize from bytes using rkyv.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, $crate::Error> {
                let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
                    .map_err(|e| $crate::Error::Deserialization(e.to_string()))
            }
        }
    };
}
