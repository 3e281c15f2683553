//! Cached pairs
//!
//! A pair is the in-memory record of one block: its identity, its value,
//! the lock clients pin it with, and the bookkeeping the evictor and the
//! checkpointer need. Pairs are shared through `Arc` between the hash
//! buckets, the clock ring and whichever thread is working on them, so a
//! pair removed from the table stays valid for anyone still holding it;
//! such holders see `PairState::Removed` and retry their lookup.

use crate::cachefile::CachefileInner;
use crate::callbacks::CacheValue;
use crate::pair_lock::PairLock;
use cachetable_common::{BlockNum, CacheDirty, FileNum, FullHash, PairAttr};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Upper bound of the clock counter
pub const CLOCK_SATURATION: u32 = 15;

/// Identity of a cached block
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PairKey {
    /// Owning cachefile
    pub filenum: FileNum,
    /// Block within the cachefile
    pub blocknum: BlockNum,
}

impl PairKey {
    /// Create a key
    #[must_use]
    pub const fn new(filenum: FileNum, blocknum: BlockNum) -> Self {
        Self { filenum, blocknum }
    }

    /// Bucket hash of this key
    #[must_use]
    pub fn fullhash(&self) -> FullHash {
        cachetable_common::fullhash(self.filenum, self.blocknum)
    }
}

/// Lifecycle of a pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PairState {
    /// Inserted, value still being read
    Fetching,
    /// Value resident
    Available,
    /// Value resident, missing content being read
    PartialFetching,
    /// Unlinked from the table
    Removed,
}

impl PairState {
    /// Whether the pair holds a value, complete or not
    #[must_use]
    pub const fn is_resident(self) -> bool {
        matches!(self, Self::Available | Self::PartialFetching)
    }
}

/// Mutable bookkeeping of a pair, guarded by the pair's metadata mutex
#[derive(Debug)]
pub(crate) struct PairMeta {
    pub(crate) state: PairState,
    pub(crate) attr: PairAttr,
    pub(crate) dirty: CacheDirty,
    /// Bumped each time the pair is dirtied; a clone write clears the
    /// dirty flag only if no newer modification happened meanwhile
    pub(crate) dirty_gen: u64,
    pub(crate) checkpoint_pending: bool,
}

/// One cached block
pub(crate) struct Pair<V> {
    key: PairKey,
    fullhash: FullHash,
    slot: usize,
    cachefile: Arc<CachefileInner<V>>,
    pub(crate) lock: PairLock,
    value: RwLock<Option<V>>,
    meta: Mutex<PairMeta>,
    clock: AtomicU32,
}

impl<V: CacheValue> Pair<V> {
    /// A pair whose value is still to be fetched, locked `WriteExpensive`
    pub(crate) fn fetching(key: PairKey, slot: usize, cachefile: Arc<CachefileInner<V>>) -> Self {
        Self {
            key,
            fullhash: key.fullhash(),
            slot,
            cachefile,
            lock: PairLock::new_locked(cachetable_common::PairLockType::WriteExpensive),
            value: RwLock::new(None),
            meta: Mutex::new(PairMeta {
                state: PairState::Fetching,
                attr: PairAttr::new(0),
                dirty: CacheDirty::Clean,
                dirty_gen: 0,
                checkpoint_pending: false,
            }),
            clock: AtomicU32::new(1),
        }
    }

    /// A pair created from a value supplied by the client, dirty and
    /// locked `WriteExpensive`
    pub(crate) fn inserted(
        key: PairKey,
        slot: usize,
        cachefile: Arc<CachefileInner<V>>,
        value: V,
        attr: PairAttr,
    ) -> Self {
        Self {
            key,
            fullhash: key.fullhash(),
            slot,
            cachefile,
            lock: PairLock::new_locked(cachetable_common::PairLockType::WriteExpensive),
            value: RwLock::new(Some(value)),
            meta: Mutex::new(PairMeta {
                state: PairState::Available,
                attr,
                dirty: CacheDirty::Dirty,
                dirty_gen: 1,
                checkpoint_pending: false,
            }),
            clock: AtomicU32::new(1),
        }
    }

    pub(crate) fn key(&self) -> PairKey {
        self.key
    }

    pub(crate) fn blocknum(&self) -> BlockNum {
        self.key.blocknum
    }

    pub(crate) fn fullhash(&self) -> FullHash {
        self.fullhash
    }

    /// Clock ring slot, stable for the pair's lifetime
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn cachefile(&self) -> &Arc<CachefileInner<V>> {
        &self.cachefile
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, PairMeta> {
        self.meta.lock()
    }

    pub(crate) fn state(&self) -> PairState {
        self.meta.lock().state
    }

    /// Whether a lock holder may use the value
    pub(crate) fn is_available(&self) -> bool {
        self.state() == PairState::Available
    }

    pub(crate) fn attr(&self) -> PairAttr {
        self.meta.lock().attr
    }

    /// Record a hit
    pub(crate) fn touch(&self) {
        let _ = self
            .clock
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                (count < CLOCK_SATURATION).then_some(count + 1)
            });
    }

    /// Age the pair by one clock step; returns the count before aging
    pub(crate) fn age(&self) -> u32 {
        match self
            .clock
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    pub(crate) fn clock_count(&self) -> u32 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Shared access to the value; the caller holds the pair lock
    pub(crate) fn read_value(&self) -> MappedRwLockReadGuard<'_, V> {
        RwLockReadGuard::map(self.value.read(), |value| {
            value.as_ref().expect("locked pair has no value")
        })
    }

    /// Exclusive access to the value; the caller holds a write lock
    pub(crate) fn write_value(&self) -> MappedRwLockWriteGuard<'_, V> {
        RwLockWriteGuard::map(self.value.write(), |value| {
            value.as_mut().expect("locked pair has no value")
        })
    }

    pub(crate) fn install_value(&self, value: V) {
        *self.value.write() = Some(value);
    }

    pub(crate) fn take_value(&self) -> Option<V> {
        self.value.write().take()
    }

    /// Diagnostic snapshot
    pub(crate) fn info(&self) -> PairInfo {
        let meta = self.meta.lock();
        PairInfo {
            key: self.key,
            attr: meta.attr,
            dirty: meta.dirty,
            checkpoint_pending: meta.checkpoint_pending,
            state: meta.state,
            clock_count: self.clock_count(),
            locked: self.lock.is_locked(),
            clone_in_flight: self.lock.clone_flush_in_flight(),
        }
    }
}

/// Point-in-time view of a pair, for diagnostics and tests
#[derive(Clone, Debug, Serialize)]
pub struct PairInfo {
    /// Identity
    pub key: PairKey,
    /// Recorded footprint
    pub attr: PairAttr,
    /// Dirty flag
    pub dirty: CacheDirty,
    /// Marked for the checkpoint in progress
    pub checkpoint_pending: bool,
    /// Lifecycle state
    pub state: PairState,
    /// Clock counter
    pub clock_count: u32,
    /// Held by anyone
    pub locked: bool,
    /// A clone write is outstanding
    pub clone_in_flight: bool,
}
