//! Block headers and hashes as seen over the wire.
use std::fmt;

use serde::{Deserialize, Serialize};

use hsync_types::network::Height;

/// A 32-byte block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash, used as the previous-hash of genesis.
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A block header: just enough to drive the synchronizer's chain-linking decisions.
/// Proof-of-work and other consensus validation is the job of the (out of scope)
/// persistent store a real deployment plugs in; this crate only checks hash-linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Height this header claims.
    pub height: Height,
    /// This header's own hash.
    pub hash: BlockHash,
    /// Hash of the header that precedes it.
    pub prev_hash: BlockHash,
}

impl Header {
    /// A synthetic genesis header (height 0, all-zero previous hash).
    pub fn genesis(hash: BlockHash) -> Self {
        Self {
            height: 0,
            hash,
            prev_hash: BlockHash::ZERO,
        }
    }
}
