//! 256-bit tree hashing using BLAKE3
//!
//! Every node of the state tree folds down to a [`TreeHash`]: block hashes
//! are bound to their byte offset, file root hashes are bound to the file
//! name, and directory hashes are the XOR of their children. XOR folding is
//! commutative, so a single child change updates a directory hash in O(1)
//! (XOR the old contribution out, XOR the new one in).

use std::fmt;
use std::ops::{BitXor, BitXorAssign};

use serde::{Deserialize, Serialize};

/// A 256-bit hash over state-tree content (BLAKE3)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeHash([u8; 32]);

impl TreeHash {
    /// Size of a serialized hash in bytes
    pub const SIZE: usize = 32;

    /// The all-zero hash: the fold identity and the hash of an empty directory
    pub const ZERO: Self = Self([0u8; 32]);

    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap raw hash bytes
    #[must_use]
    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a block bound to its byte offset: `H(offset_le64 ‖ block)`.
    ///
    /// Mixing the offset in means two equal blocks at different positions
    /// hash differently, so swapping equal-length runs changes the file
    /// root hash.
    #[must_use]
    pub fn block(offset: u64, block: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&offset.to_le_bytes());
        hasher.update(block);
        Self(*hasher.finalize().as_bytes())
    }

    /// Hash a file root bound to its name: `H(name ‖ folded_block_hashes)`.
    ///
    /// `folded` is the XOR of all block hashes (`ZERO` for an empty file).
    /// Mixing the name in keeps two identically-named-content files in one
    /// directory from cancelling inside the directory fold.
    #[must_use]
    pub fn file_root(name: &[u8], folded: Self) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(name);
        hasher.update(&folded.0);
        Self(*hasher.finalize().as_bytes())
    }

    /// Get raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to a lowercase hex string (64 chars)
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex string
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let raw: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    /// Whether this is the all-zero hash
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl BitXor for TreeHash {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        self ^= rhs;
        self
    }
}

impl BitXorAssign for TreeHash {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "TreeHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}
