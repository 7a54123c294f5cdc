//! Core type definitions for SliceIO
//!
//! This module defines the addressing types for stored data (digests, slice
//! keys, slices) and the identifiers of the actors that serve them.

use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a datanode process
pub type DatanodeId = u32;

/// Identifier of a bucket (storage shard) within a datanode
pub type BucketId = u32;

/// Identifier of a channel within a bucket
pub type ChannelId = u32;

/// Identifier of a slice database within a bucket
pub type SliceDbId = u32;

/// Content digest of a client key (MD5, 16 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct Digest([u8; 16]);

impl Digest {
    /// Width of the digest in bytes
    pub const LEN: usize = 16;

    /// Compute the digest of a client key
    #[must_use]
    pub fn of(key: &[u8]) -> Self {
        Self(md5::compute(key).0)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Address of one slice: `(digest, slice_index)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceKey {
    pub digest: Digest,
    pub slice_index: u32,
}

impl SliceKey {
    /// Encoded width: digest followed by a big-endian slice index
    pub const ENCODED_LEN: usize = Digest::LEN + 4;

    #[must_use]
    pub const fn new(digest: Digest, slice_index: u32) -> Self {
        Self {
            digest,
            slice_index,
        }
    }

    /// Key for a client key's slice
    #[must_use]
    pub fn for_key(key: &[u8], slice_index: u32) -> Self {
        Self::new(Digest::of(key), slice_index)
    }

    /// Encode as the byte key used in every slice and metadata database
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..Digest::LEN].copy_from_slice(self.digest.as_bytes());
        out[Digest::LEN..].copy_from_slice(&self.slice_index.to_be_bytes());
        out
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.digest, self.slice_index)
    }
}

/// One addressable unit of stored payload bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slice {
    pub key: SliceKey,
    pub data: Bytes,
}

impl Slice {
    #[must_use]
    pub fn new(key: SliceKey, data: impl Into<Bytes>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Location record stored in a bucket's metadata database
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceLocation {
    pub version: u32,
    pub slicedb_id: SliceDbId,
}

impl SliceLocation {
    #[must_use]
    pub const fn new(slicedb_id: SliceDbId) -> Self {
        Self {
            version: 0,
            slicedb_id,
        }
    }
}

/// Stable identity of a worker connection as seen by the broker
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    /// Identity announced by a channel in its READY frame
    #[must_use]
    pub fn for_channel(datanode: DatanodeId, bucket: BucketId, channel: ChannelId) -> Self {
        Self(format!("dn{datanode}-b{bucket}-c{channel}"))
    }

    /// Fallback identity for a connection that has not announced itself
    #[must_use]
    pub fn for_connection(conn_id: u64) -> Self {
        Self(format!("conn-{conn_id:016x}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerIdentity({:?})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_md5() {
        // RFC 1321 test vector
        assert_eq!(
            Digest::of(b"abc").to_hex(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_slice_key_bytes() {
        let key = SliceKey::for_key(b"alpha", 7);
        let bytes = key.to_bytes();
        assert_eq!(&bytes[..16], key.digest.as_bytes());
        assert_eq!(&bytes[16..], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_worker_identity() {
        assert_eq!(WorkerIdentity::for_channel(0, 3, 1).as_str(), "dn0-b3-c1");
        assert_eq!(
            WorkerIdentity::for_connection(255).to_string(),
            "conn-00000000000000ff"
        );
    }
}
