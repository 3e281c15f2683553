//! Core type definitions for the cachetable
//!
//! This module defines the identifiers used to address cached blocks, the
//! per-pair size attribute, and the small enums shared between the cache and
//! the layer that owns the block contents.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an open cachefile, unique within one cachetable
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct FileNum(u32);

impl FileNum {
    /// Create a file number from its raw value
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for FileNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileNum({})", self.0)
    }
}

/// Logical block number within a cachefile
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct BlockNum(i64);

impl BlockNum {
    /// Create a block number from its raw value
    #[must_use]
    pub const fn new(n: i64) -> Self {
        Self(n)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Debug for BlockNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockNum({})", self.0)
    }
}

/// Log sequence number supplied by the write-ahead log
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into,
    Display,
)]
#[display("{_0}")]
pub struct Lsn(u64);

impl Lsn {
    /// The LSN before any log record was written
    pub const ZERO: Self = Self(0);

    /// Create an LSN from its raw value
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self.0)
    }
}

/// Hash of a (file, block) identity, used to pick a table bucket
pub type FullHash = u32;

/// Compute the full hash of a block identity
#[must_use]
pub fn fullhash(filenum: FileNum, blocknum: BlockNum) -> FullHash {
    let mut buf = [0u8; 12];
    buf[..4].copy_from_slice(&filenum.get().to_le_bytes());
    buf[4..].copy_from_slice(&blocknum.get().to_le_bytes());
    let h = xxhash_rust::xxh64::xxh64(&buf, 0);
    (h ^ (h >> 32)) as u32
}

/// Approximate in-memory footprint of a cached value
///
/// `size` is what counts against the cache limit. The class sizes break
/// the same bytes down by node kind for reporting only.
///
/// `is_valid == false` means "no new information": an unpin carrying an
/// invalid attribute leaves the pair's recorded size untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairAttr {
    /// Bytes charged against the cache size limit
    pub size: i64,
    /// Bytes held by interior tree nodes
    pub nonleaf_size: i64,
    /// Bytes held by leaf nodes
    pub leaf_size: i64,
    /// Bytes held by rollback log nodes
    pub rollback_size: i64,
    /// Bytes of work the cleaner could push out of this pair
    pub cache_pressure_size: i64,
    /// Whether this attribute carries a real measurement
    pub is_valid: bool,
}

impl PairAttr {
    /// A valid attribute of the given size
    #[must_use]
    pub const fn new(size: i64) -> Self {
        Self {
            size,
            nonleaf_size: 0,
            leaf_size: 0,
            rollback_size: 0,
            cache_pressure_size: 0,
            is_valid: true,
        }
    }

    /// An attribute that carries no measurement
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            is_valid: false,
            ..Self::new(0)
        }
    }

    /// Set the cache pressure component
    #[must_use]
    pub const fn with_cache_pressure(mut self, bytes: i64) -> Self {
        self.cache_pressure_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_nonleaf_size(mut self, bytes: i64) -> Self {
        self.nonleaf_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_leaf_size(mut self, bytes: i64) -> Self {
        self.leaf_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_rollback_size(mut self, bytes: i64) -> Self {
        self.rollback_size = bytes;
        self
    }
}

/// Dirty state of a cached value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheDirty {
    /// Matches what is on disk
    #[default]
    Clean,
    /// Modified since it was last written
    Dirty,
}

impl CacheDirty {
    /// Check if this is the dirty state
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::Dirty)
    }
}

impl From<bool> for CacheDirty {
    fn from(dirty: bool) -> Self {
        if dirty { Self::Dirty } else { Self::Clean }
    }
}

/// Strength of a pair lock acquisition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairLockType {
    /// Shared access
    Read,
    /// Exclusive, but a checkpoint may still write a clone of the pair
    WriteCheap,
    /// Exclusive, and no clone write may be in flight
    WriteExpensive,
}

impl PairLockType {
    /// Check if this is one of the exclusive modes
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Check if this is the expensive exclusive mode
    #[must_use]
    pub const fn is_expensive(self) -> bool {
        matches!(self, Self::WriteExpensive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_fullhash_is_stable() {
        let a = fullhash(FileNum::new(1), BlockNum::new(42));
        let b = fullhash(FileNum::new(1), BlockNum::new(42));
        assert_eq!(a, b);
        assert_ne!(a, fullhash(FileNum::new(2), BlockNum::new(42)));
    }

    #[test]
    fn test_fullhash_spreads_low_bits() {
        let buckets: HashSet<u32> = (0..256)
            .map(|b| fullhash(FileNum::new(7), BlockNum::new(b)) & 63)
            .collect();
        // 256 consecutive blocks should land in most of 64 buckets
        assert!(buckets.len() > 48);
    }

    #[test]
    fn test_pair_attr_constructors() {
        let attr = PairAttr::new(8).with_cache_pressure(3);
        assert!(attr.is_valid);
        assert_eq!(attr.size, 8);
        assert_eq!(attr.cache_pressure_size, 3);
        assert!(!PairAttr::invalid().is_valid);
        assert_eq!(attr.leaf_size, 0);

        let leaf = PairAttr::new(10).with_leaf_size(6).with_rollback_size(4);
        assert_eq!((leaf.leaf_size, leaf.rollback_size, leaf.nonleaf_size), (6, 4, 0));
    }

    #[test]
    fn test_lock_type_predicates() {
        assert!(!PairLockType::Read.is_write());
        assert!(PairLockType::WriteCheap.is_write());
        assert!(!PairLockType::WriteCheap.is_expensive());
        assert!(PairLockType::WriteExpensive.is_expensive());
    }

    #[test]
    fn test_display_and_conversions() {
        assert_eq!(BlockNum::new(5).to_string(), "5");
        assert_eq!(format!("{:?}", FileNum::new(3)), "FileNum(3)");
        let raw: u64 = Lsn::new(9).into();
        assert_eq!(raw, 9);
        assert_eq!(CacheDirty::from(true), CacheDirty::Dirty);
    }
}
