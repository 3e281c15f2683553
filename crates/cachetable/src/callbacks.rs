//! Callbacks the owning layer registers per cachefile
//!
//! The cache never interprets block contents. Everything that touches the
//! bytes of a block (reading, writing, shrinking, completing, cloning) is
//! delegated to a [`PairCallbacks`] implementation supplied when the
//! cachefile is opened.

use cachetable_common::{BlockNum, CacheDirty, FullHash, Lsn, PairAttr, Result};
use std::fs::File;

/// Bound satisfied by every type that can be cached
pub trait CacheValue: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> CacheValue for T {}

/// A block as produced by a fetch
#[derive(Debug)]
pub struct Fetched<V> {
    /// Deserialized contents
    pub value: V,
    /// Footprint of the contents
    pub attr: PairAttr,
    /// Whether the contents already differ from disk (e.g. upgraded on read)
    pub dirty: CacheDirty,
}

impl<V> Fetched<V> {
    /// A freshly read block that matches disk
    pub fn clean(value: V, attr: PairAttr) -> Self {
        Self {
            value,
            attr,
            dirty: CacheDirty::Clean,
        }
    }
}

/// Flags describing one flush request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushArgs {
    /// The value is dirty and must be written
    pub write_me: bool,
    /// The value stays cached after the call
    pub keep_me: bool,
    /// The write belongs to the checkpoint in progress
    pub for_checkpoint: bool,
    /// The value handed over is a checkpoint clone, not the live value
    pub is_clone: bool,
}

/// How expensive a partial eviction would be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialEvictionCost {
    /// Run inline on the evictor thread
    Cheap,
    /// Run on a background worker
    Expensive,
}

/// Result of a partial eviction estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialEvictionEstimate {
    /// Bytes a partial eviction is expected to release
    pub bytes_freeable: i64,
    /// Where the eviction should run
    pub cost: PartialEvictionCost,
}

impl PartialEvictionEstimate {
    /// Nothing can be released
    #[must_use]
    pub const fn none() -> Self {
        Self {
            bytes_freeable: 0,
            cost: PartialEvictionCost::Cheap,
        }
    }

    /// A cheap eviction of the given size
    #[must_use]
    pub const fn cheap(bytes_freeable: i64) -> Self {
        Self {
            bytes_freeable,
            cost: PartialEvictionCost::Cheap,
        }
    }

    /// An expensive eviction of the given size
    #[must_use]
    pub const fn expensive(bytes_freeable: i64) -> Self {
        Self {
            bytes_freeable,
            cost: PartialEvictionCost::Expensive,
        }
    }
}

/// Immutable snapshot of a value taken for checkpoint writeback
#[derive(Debug)]
pub struct Cloned<V> {
    /// The snapshot
    pub value: V,
    /// Bytes the snapshot occupies while it waits to be written
    pub size: i64,
}

/// Result of one cleaner invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanerOutcome {
    /// `Dirty` if the cleaner modified the value
    pub dirty: CacheDirty,
    /// New footprint of the value
    pub attr: PairAttr,
}

/// Callback bundle registered per cachefile
///
/// Only `fetch` and `flush` are mandatory. The defaults describe a block
/// type that cannot be partially evicted, partially fetched, cloned or
/// cleaned, and that keeps no per-checkpoint header state.
pub trait PairCallbacks<V>: Send + Sync + 'static {
    /// Read and deserialize a block
    fn fetch(&self, file: &File, blocknum: BlockNum, fullhash: FullHash) -> Result<Fetched<V>>;

    /// Persist and/or release a value, returning its footprint afterwards
    ///
    /// An error from a flush with `write_me` set is fatal to the process.
    fn flush(
        &self,
        file: &File,
        blocknum: BlockNum,
        value: &V,
        attr: PairAttr,
        args: FlushArgs,
    ) -> Result<PairAttr>;

    /// Estimate how much a partial eviction would release
    fn pe_estimate(&self, _value: &V, _attr: PairAttr) -> PartialEvictionEstimate {
        PartialEvictionEstimate::none()
    }

    /// Shrink the value in place and report its new footprint
    fn pe_execute(&self, _value: &mut V, attr: PairAttr) -> PairAttr {
        attr
    }

    /// Whether the resident value is missing content a pin needs
    fn pf_req(&self, _value: &V) -> bool {
        false
    }

    /// Read the missing content and report the new footprint
    fn pf_execute(&self, _file: &File, _blocknum: BlockNum, _value: &mut V) -> Result<PairAttr> {
        Err(cachetable_common::CachetableError::callback(
            "partial fetch requested but not supported",
        ))
    }

    /// Snapshot the value for checkpoint writeback; `None` if unsupported
    fn clone_value(&self, _value: &V) -> Option<Cloned<V>> {
        None
    }

    /// Do background maintenance on a value under cache pressure
    fn cleaner(
        &self,
        _blocknum: BlockNum,
        _value: &mut V,
        attr: PairAttr,
    ) -> Result<CleanerOutcome> {
        Ok(CleanerOutcome {
            dirty: CacheDirty::Clean,
            attr,
        })
    }

    /// Called when a checkpoint begins, before pairs are marked pending
    fn begin_checkpoint(&self, _lsn: Lsn) {}

    /// Called once every pending pair of the checkpoint is durable
    fn checkpoint(&self, _file: &File, _lsn: Lsn) -> Result<()> {
        Ok(())
    }

    /// Called when the checkpoint completes
    fn end_checkpoint(&self, _lsn: Lsn) {}

    /// Called after the last pair of a closing cachefile has been flushed
    fn on_close(&self, _file: &File) -> Result<()> {
        Ok(())
    }
}
