use blake2::Blake2b;
use blake2::digest::Digest;
use blake2::digest::consts::U32;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PackError, Result};

/// Unkeyed BLAKE2b with a 32-byte output. Used for pack and index identifiers.
pub type Blake2b256 = Blake2b<U32>;

/// A 32-byte pack file identifier computed as unkeyed BLAKE2b-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackId(pub [u8; 32]);

impl PackId {
    /// Compute a pack ID as unkeyed BLAKE2b-256 of the entire pack contents.
    pub fn compute(data: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Blake2b256::digest(data));
        PackId(out)
    }

    /// Build an ID from a finished 32-byte digest.
    pub fn from_digest(digest: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = digest.try_into().map_err(|_| {
            PackError::InvalidFormat(format!("pack digest has {} bytes, want 32", digest.len()))
        })?;
        Ok(PackId(bytes))
    }

    /// Hex-encode the full pack ID.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Storage key path: `packs/<shard>/<full_hex>`.
    pub fn storage_key(&self) -> String {
        format!("packs/{}/{}", self.shard_prefix(), self.to_hex())
    }
}

impl fmt::Debug for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
