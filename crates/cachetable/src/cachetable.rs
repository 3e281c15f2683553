//! Cachetable facade
//!
//! [`Cachetable`] is the entry point for the layer above: it opens
//! cachefiles, pins and unpins blocks, inserts new blocks, prefetches, and
//! drives checkpoints. A pin is represented by a [`PinnedPair`] token, so
//! a pair can only be unpinned once and only by whoever pinned it.

use crate::cachefile::{Cachefile, CachefileInner, CachefileList};
use crate::callbacks::{CacheValue, FlushArgs, PairCallbacks};
use crate::checkpointer::{CheckpointState, Checkpointer};
use crate::cleaner::Cleaner;
use crate::evictor::Evictor;
use crate::kibbutz::Kibbutz;
use crate::pair::{Pair, PairInfo, PairKey, PairState};
use crate::pair_table::PairTable;
use crate::status::{CachetableStats, CachetableStatus};
use cachetable_common::{
    BlockNum, CacheDirty, CachetableConfig, CachetableError, FileNum, Lsn, PairAttr,
    PairLockType, Result,
};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// State shared by the facade, the background threads and queued jobs
pub(crate) struct Shared<V: CacheValue> {
    pub(crate) config: CachetableConfig,
    pub(crate) table: PairTable<V>,
    pub(crate) evictor: Evictor,
    pub(crate) cleaner: Cleaner,
    pub(crate) checkpoint: CheckpointState<V>,
    pub(crate) cachefiles: CachefileList<V>,
    pub(crate) client_pool: Kibbutz,
    pub(crate) cachetable_pool: Kibbutz,
    pub(crate) checkpoint_pool: Kibbutz,
    pub(crate) stats: CachetableStats,
    closed: AtomicBool,
    stopped: AtomicBool,
}

impl<V: CacheValue> Shared<V> {
    fn new(config: CachetableConfig, initial_lsn: Lsn) -> Result<Self> {
        let pools = &config.kibbutz;
        Ok(Self {
            table: PairTable::new(config.bucket_count),
            evictor: Evictor::new(&config),
            cleaner: Cleaner::new(&config.cleaner),
            checkpoint: CheckpointState::new(initial_lsn, &config.checkpoint),
            cachefiles: CachefileList::new(),
            client_pool: Kibbutz::new("ct-client", pools.client_threads, pools.queue_depth)?,
            cachetable_pool: Kibbutz::new(
                "ct-evict",
                pools.cachetable_threads,
                pools.queue_depth,
            )?,
            checkpoint_pool: Kibbutz::new(
                "ct-checkpoint",
                pools.checkpoint_threads,
                pools.queue_depth,
            )?,
            stats: CachetableStats::default(),
            closed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            config,
        })
    }

    /// Hand a value to its cachefile's flush callback
    ///
    /// A failed flush leaves a block we can neither keep consistent nor
    /// drop, so the process aborts.
    pub(crate) fn flush_pair(
        &self,
        pair: &Pair<V>,
        value: &V,
        attr: PairAttr,
        args: FlushArgs,
    ) -> PairAttr {
        let cf = pair.cachefile();
        match cf.callbacks().flush(cf.file(), pair.blocknum(), value, attr, args) {
            Ok(new_attr) => new_attr,
            Err(e) => {
                error!(
                    "Flush of block {} in cachefile {} failed ({:?}): {}",
                    pair.blocknum(),
                    cf.filenum(),
                    args,
                    e
                );
                std::process::abort();
            }
        }
    }

    /// Record a new footprint; invalid attributes are ignored
    pub(crate) fn set_pair_attr(&self, pair: &Pair<V>, attr: PairAttr) {
        if !attr.is_valid {
            return;
        }
        let mut meta = pair.meta();
        self.evictor.change_pair_attr(&meta.attr, &attr);
        meta.attr = attr;
    }

    /// Unlink a pair and take its value; the caller holds it `WriteExpensive`
    pub(crate) fn remove_pair(&self, pair: &Arc<Pair<V>>) -> Option<V> {
        self.table.remove(pair);
        {
            let mut meta = pair.meta();
            meta.state = PairState::Removed;
            meta.checkpoint_pending = false;
            self.evictor.remove_pair_attr(&meta.attr);
        }
        pair.take_value()
    }

    fn maybe_wake_evictor(&self) {
        if self.evictor.should_client_wake() {
            self.evictor.signal();
        }
    }

    fn wait_for_cache_pressure(&self) {
        if self.evictor.should_client_sleep() {
            let waited = self.evictor.wait_for_pressure_to_subside();
            self.stats.record_pressure_wait(waited);
        }
    }

    /// Read the value of a freshly inserted pair locked `WriteExpensive`
    ///
    /// On failure the pair is removed and unlocked.
    fn fetch_locked_pair(&self, pair: &Arc<Pair<V>>) -> Result<()> {
        let cf = pair.cachefile();
        let start = Instant::now();
        match cf.callbacks().fetch(cf.file(), pair.blocknum(), pair.fullhash()) {
            Ok(fetched) => {
                pair.install_value(fetched.value);
                let attr = if fetched.attr.is_valid {
                    fetched.attr
                } else {
                    PairAttr::new(0)
                };
                {
                    let mut meta = pair.meta();
                    meta.attr = attr;
                    meta.dirty = fetched.dirty;
                    if fetched.dirty.is_dirty() {
                        meta.dirty_gen += 1;
                    }
                    meta.state = PairState::Available;
                    self.evictor.add_pair_attr(&attr);
                }
                self.stats.record_miss(start.elapsed());
                self.maybe_wake_evictor();
                Ok(())
            }
            Err(e) => {
                debug!(
                    "Fetch of block {} in cachefile {} failed: {}",
                    pair.blocknum(),
                    cf.filenum(),
                    e
                );
                self.remove_pair(pair);
                pair.lock.release(PairLockType::WriteExpensive);
                Err(e)
            }
        }
    }

    /// Complete a partially resident value; the caller holds `WriteExpensive`
    fn partial_fetch_locked_pair(&self, pair: &Pair<V>) -> Result<()> {
        let cf = pair.cachefile();
        let mut value = pair.write_value();
        if !cf.callbacks().pf_req(&value) {
            return Ok(());
        }
        pair.meta().state = PairState::PartialFetching;
        let result = cf.callbacks().pf_execute(cf.file(), pair.blocknum(), &mut value);
        drop(value);
        pair.meta().state = PairState::Available;
        let attr = result.map_err(|e| CachetableError::PartialFetch {
            filenum: cf.filenum(),
            blocknum: pair.blocknum(),
            reason: e.to_string(),
        })?;
        self.set_pair_attr(pair, attr);
        self.stats.partial_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Finish a blocking pin of a resident pair
    ///
    /// Returns the mode now held, or `None` if the lock was dropped and
    /// the caller must look the pair up again.
    fn finish_pin(
        self: &Arc<Self>,
        pair: &Arc<Pair<V>>,
        mode: PairLockType,
    ) -> Result<Option<PairLockType>> {
        if mode.is_write() {
            let _pending = self.table.pending_lock.read();
            self.checkpoint_locked_pair(pair, mode, true);
        }
        if !needs_partial_fetch(pair) {
            return Ok(Some(mode));
        }
        match mode {
            PairLockType::Read => {
                pair.lock.release(PairLockType::Read);
                pair.lock.acquire(PairLockType::WriteExpensive);
                let result = if pair.is_available() {
                    self.partial_fetch_locked_pair(pair)
                } else {
                    Ok(())
                };
                pair.lock.release(PairLockType::WriteExpensive);
                result.map(|()| None)
            }
            PairLockType::WriteCheap | PairLockType::WriteExpensive => {
                if mode == PairLockType::WriteCheap {
                    pair.lock.upgrade();
                }
                if let Err(e) = self.partial_fetch_locked_pair(pair) {
                    pair.lock.release(PairLockType::WriteExpensive);
                    return Err(e);
                }
                Ok(Some(PairLockType::WriteExpensive))
            }
        }
    }

    /// Insert a pair for `key` and fetch it on the client kibbutz
    ///
    /// Returns false if the pair already exists or the cachefile is closing.
    fn schedule_fetch(self: &Arc<Self>, cf: &Arc<CachefileInner<V>>, key: PairKey) -> bool {
        let Some(job) = cf.add_job() else {
            return false;
        };
        let (pair, inserted) = self
            .table
            .find_or_insert(key, key.fullhash(), |slot| Pair::fetching(key, slot, Arc::clone(cf)));
        if !inserted {
            return false;
        }
        self.stats.prefetches.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        self.client_pool.enqueue(move || {
            match shared.fetch_locked_pair(&pair) {
                Ok(()) => pair.lock.release(PairLockType::WriteExpensive),
                Err(e) => warn!(
                    "Background fetch of block {} in cachefile {} failed: {}",
                    key.blocknum, key.filenum, e
                ),
            }
            drop(job);
        });
        true
    }

    /// Complete a partially resident pair on the client kibbutz
    fn schedule_partial_fetch(self: &Arc<Self>, pair: Arc<Pair<V>>) -> bool {
        let Some(job) = pair.cachefile().add_job() else {
            return false;
        };
        let shared = Arc::clone(self);
        self.client_pool.enqueue(move || {
            pair.lock.acquire(PairLockType::WriteExpensive);
            if pair.is_available() {
                if let Err(e) = shared.partial_fetch_locked_pair(&pair) {
                    warn!("Background partial fetch of {:?} failed: {}", pair.key(), e);
                }
            }
            pair.lock.release(PairLockType::WriteExpensive);
            drop(job);
        });
        true
    }

    /// Release a pin, recording the holder's changes
    pub(crate) fn unpin_pair(
        self: &Arc<Self>,
        pair: &Arc<Pair<V>>,
        mode: PairLockType,
        dirty: CacheDirty,
        attr: PairAttr,
    ) {
        assert!(
            mode.is_write() || !dirty.is_dirty(),
            "a read pin cannot dirty {:?}",
            pair.key()
        );
        {
            let mut meta = pair.meta();
            if dirty.is_dirty() {
                meta.dirty = CacheDirty::Dirty;
                meta.dirty_gen += 1;
            }
            if attr.is_valid {
                self.evictor.change_pair_attr(&meta.attr, &attr);
                meta.attr = attr;
            }
        }
        if mode.is_write() {
            let _pending = self.table.pending_lock.read();
            self.checkpoint_locked_pair(pair, mode, true);
        }
        pair.lock.release(mode);
        self.maybe_wake_evictor();
    }

    /// Flush every pair of a cachefile, remove them and run its close hook
    fn close_cachefile_inner(&self, cf: &Arc<CachefileInner<V>>) -> Result<()> {
        cf.jobs().wait_for_jobs_to_finish();
        let mut flushed = 0usize;
        for pair in self.table.pairs_of(cf.filenum()) {
            pair.lock.acquire(PairLockType::WriteExpensive);
            if !pair.is_available() {
                pair.lock.release(PairLockType::WriteExpensive);
                continue;
            }
            self.evict_locked_pair(&pair);
            flushed += 1;
        }
        let result = cf.callbacks().on_close(cf.file());
        self.cachefiles.remove(cf.filenum());
        info!("Closed cachefile {} ({} pairs released)", cf.filenum(), flushed);
        result
    }

    fn stop_threads(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.checkpoint.stop_periodic();
        self.evictor.shutdown();
        self.cleaner.shutdown();
        self.client_pool.shutdown();
        self.cachetable_pool.shutdown();
        self.checkpoint_pool.shutdown();
    }
}

fn needs_partial_fetch<V: CacheValue>(pair: &Pair<V>) -> bool {
    pair.cachefile().callbacks().pf_req(&pair.read_value())
}

struct CachetableInner<V: CacheValue> {
    shared: Arc<Shared<V>>,
}

impl<V: CacheValue> Drop for CachetableInner<V> {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::Acquire) {
            debug!("Cachetable dropped without close; stopping background threads");
        }
        self.shared.stop_threads();
    }
}

/// Outcome of a nonblocking pin
pub enum PinAttempt<V: CacheValue> {
    /// The pair is pinned in the requested mode
    Pinned(PinnedPair<V>),
    /// The pin would have blocked; the unlocker has run, try again later
    TryAgain,
}

impl<V: CacheValue> PinAttempt<V> {
    pub fn is_try_again(&self) -> bool {
        matches!(self, Self::TryAgain)
    }

    /// The pin, if one was granted
    pub fn pinned(self) -> Option<PinnedPair<V>> {
        match self {
            Self::Pinned(pinned) => Some(pinned),
            Self::TryAgain => None,
        }
    }
}

impl<V: CacheValue> fmt::Debug for PinAttempt<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pinned(pinned) => f.debug_tuple("Pinned").field(pinned).finish(),
            Self::TryAgain => f.write_str("TryAgain"),
        }
    }
}

/// A pinned pair
///
/// Dropping the token without unpinning releases the pin as if unpinned
/// clean with no new size information.
pub struct PinnedPair<V: CacheValue> {
    shared: Arc<Shared<V>>,
    pair: Arc<Pair<V>>,
    mode: PairLockType,
    released: bool,
}

impl<V: CacheValue> PinnedPair<V> {
    fn new(shared: &Arc<Shared<V>>, pair: Arc<Pair<V>>, mode: PairLockType) -> Self {
        Self {
            shared: Arc::clone(shared),
            pair,
            mode,
            released: false,
        }
    }

    fn disarm(mut self) -> (Arc<Shared<V>>, Arc<Pair<V>>, PairLockType) {
        self.released = true;
        (Arc::clone(&self.shared), Arc::clone(&self.pair), self.mode)
    }

    pub fn filenum(&self) -> FileNum {
        self.pair.key().filenum
    }

    pub fn blocknum(&self) -> BlockNum {
        self.pair.blocknum()
    }

    /// Mode the pair is held in
    pub fn lock_type(&self) -> PairLockType {
        self.mode
    }

    /// Recorded footprint
    pub fn attr(&self) -> PairAttr {
        self.pair.attr()
    }

    pub fn is_dirty(&self) -> bool {
        self.pair.meta().dirty.is_dirty()
    }

    /// Shared access to the value
    pub fn value(&self) -> MappedRwLockReadGuard<'_, V> {
        self.pair.read_value()
    }

    /// Exclusive access to the value
    ///
    /// # Panics
    ///
    /// Panics if the pair is pinned for reading.
    pub fn value_mut(&mut self) -> MappedRwLockWriteGuard<'_, V> {
        assert!(self.mode.is_write(), "{:?} is pinned for reading", self.pair.key());
        self.pair.write_value()
    }

    /// Release the pin
    ///
    /// `dirty` marks the value modified; a valid `attr` replaces the
    /// recorded footprint.
    pub fn unpin(self, dirty: CacheDirty, attr: PairAttr) {
        let (shared, pair, mode) = self.disarm();
        shared.unpin_pair(&pair, mode, dirty, attr);
    }

    /// Remove the pair from the cache without writing it
    ///
    /// `on_removed` runs after every cache lock is released and receives
    /// the block number and whether the pair was pending for a checkpoint.
    ///
    /// # Panics
    ///
    /// Panics if the pair is pinned for reading.
    pub fn unpin_and_remove(self, on_removed: impl FnOnce(BlockNum, bool)) {
        let (shared, pair, mode) = self.disarm();
        assert!(mode.is_write(), "unpin_and_remove of {:?} needs a write pin", pair.key());
        if mode == PairLockType::WriteCheap {
            pair.lock.upgrade();
        }
        let (was_pending, value) = {
            let _pending = shared.table.pending_lock.read();
            let was_pending = pair.meta().checkpoint_pending;
            (was_pending, shared.remove_pair(&pair))
        };
        pair.lock.release(PairLockType::WriteExpensive);
        drop(value);
        debug!("Removed {:?} (pending: {})", pair.key(), was_pending);
        on_removed(pair.blocknum(), was_pending);
    }
}

impl<V: CacheValue> Drop for PinnedPair<V> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!("{:?} dropped while pinned; unpinning clean", self.pair.key());
        self.shared
            .unpin_pair(&self.pair, self.mode, CacheDirty::Clean, PairAttr::invalid());
    }
}

impl<V: CacheValue> fmt::Debug for PinnedPair<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedPair")
            .field("key", &self.pair.key())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn try_again<V: CacheValue>(
    unlocker: impl FnOnce(),
    key: PairKey,
    reason: &str,
) -> Result<PinAttempt<V>> {
    trace!("Nonblocking pin of {:?} must retry: {}", key, reason);
    unlocker();
    Ok(PinAttempt::TryAgain)
}

/// Handle to a cachetable
pub struct Cachetable<V: CacheValue> {
    inner: Arc<CachetableInner<V>>,
}

impl<V: CacheValue> Clone for Cachetable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> fmt::Debug for Cachetable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared();
        f.debug_struct("Cachetable")
            .field("pairs", &shared.table.len())
            .field("size_current", &shared.evictor.size_current())
            .field("size_limit", &shared.evictor.size_limit())
            .finish_non_exhaustive()
    }
}

impl<V: CacheValue> Cachetable<V> {
    /// Create a cachetable whose last checkpoint is `Lsn::ZERO`
    pub fn new(config: CachetableConfig) -> Result<Self> {
        Self::with_initial_lsn(config, Lsn::ZERO)
    }

    /// Create a cachetable recovering from a checkpoint at `initial_lsn`
    pub fn with_initial_lsn(config: CachetableConfig, initial_lsn: Lsn) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config, initial_lsn)?);
        let inner = Arc::new(CachetableInner {
            shared: Arc::clone(&shared),
        });
        Evictor::start(&shared)?;
        Cleaner::start(&shared)?;
        info!(
            "Created cachetable: size limit {}, {} buckets, evictor {}",
            shared.config.size_limit,
            shared.config.bucket_count,
            if shared.config.evictor.enabled { "enabled" } else { "on demand" }
        );
        Ok(Self { inner })
    }

    fn shared(&self) -> &Arc<Shared<V>> {
        &self.inner.shared
    }

    pub fn config(&self) -> &CachetableConfig {
        &self.shared().config
    }

    /// Open a file, or share it if it is already open
    pub fn open_cachefile(
        &self,
        fname: impl AsRef<Path>,
        callbacks: Arc<dyn PairCallbacks<V>>,
    ) -> Result<Cachefile<V>> {
        let inner = self.shared().cachefiles.open(fname.as_ref(), callbacks)?;
        Ok(Cachefile { inner })
    }

    pub fn cachefile_by_filenum(&self, filenum: FileNum) -> Option<Cachefile<V>> {
        self.shared()
            .cachefiles
            .get(filenum)
            .map(|inner| Cachefile { inner })
    }

    /// Drop a handle; the last one flushes and removes every pair of the
    /// file after its background jobs have finished
    pub fn close_cachefile(&self, cf: Cachefile<V>) -> Result<()> {
        let shared = self.shared();
        if !shared.cachefiles.release(cf.filenum())? {
            debug!("Cachefile {} still has open handles", cf.filenum());
            return Ok(());
        }
        shared.close_cachefile_inner(&cf.inner)
    }

    /// Write every dirty pair of a cachefile, keeping them cached
    pub fn flush_cachefile(&self, cf: &Cachefile<V>) -> Result<()> {
        let shared = self.shared();
        let mut written = 0usize;
        for pair in shared.table.pairs_of(cf.filenum()) {
            pair.lock.acquire(PairLockType::WriteExpensive);
            if pair.is_available() {
                let _pending = shared.table.pending_lock.read();
                let (attr, dirty, pending) = {
                    let meta = pair.meta();
                    (meta.attr, meta.dirty.is_dirty(), meta.checkpoint_pending)
                };
                if dirty {
                    let args = FlushArgs {
                        write_me: true,
                        keep_me: true,
                        for_checkpoint: pending,
                        is_clone: false,
                    };
                    let new_attr = shared.flush_pair(&pair, &pair.read_value(), attr, args);
                    pair.meta().dirty = CacheDirty::Clean;
                    shared.set_pair_attr(&pair, new_attr);
                    if pending {
                        shared.table.clear_pending(&pair);
                        shared.checkpoint.record_pair_written(false);
                    }
                    written += 1;
                }
            }
            pair.lock.release(PairLockType::WriteExpensive);
        }
        debug!("Flushed {} dirty pairs of cachefile {}", written, cf.filenum());
        Ok(())
    }

    /// Pin a block, fetching it if needed; blocks until the pin is granted
    pub fn get_and_pin(
        &self,
        cf: &Cachefile<V>,
        blocknum: BlockNum,
        mode: PairLockType,
    ) -> Result<PinnedPair<V>> {
        let shared = self.shared();
        let key = PairKey::new(cf.filenum(), blocknum);
        let fullhash = key.fullhash();
        loop {
            if let Some(pair) = shared.table.find(&key, fullhash) {
                pair.lock.acquire(mode);
                if !pair.is_available() {
                    pair.lock.release(mode);
                    continue;
                }
                let Some(held) = shared.finish_pin(&pair, mode)? else {
                    continue;
                };
                pair.touch();
                shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(PinnedPair::new(shared, pair, held));
            }

            if cf.is_closing() {
                return Err(CachetableError::CachefileClosing(cf.filenum()));
            }
            shared.wait_for_cache_pressure();
            let (pair, inserted) = shared.table.find_or_insert(key, fullhash, |slot| {
                Pair::fetching(key, slot, Arc::clone(&cf.inner))
            });
            if !inserted {
                continue;
            }
            shared.fetch_locked_pair(&pair)?;
            if mode != PairLockType::WriteExpensive {
                pair.lock.downgrade(mode);
            }
            return Ok(PinnedPair::new(shared, pair, mode));
        }
    }

    /// Pin a block without ever blocking
    ///
    /// When the pin cannot be granted right away (the block is absent, its
    /// lock is busy, or it needs I/O first) the needed work is started in
    /// the background, `unlocker` runs so the caller can drop the locks it
    /// holds on other pairs, and `TryAgain` is returned. `unlocker` runs
    /// exactly once in that case and never when the pin is granted.
    pub fn get_and_pin_nonblocking(
        &self,
        cf: &Cachefile<V>,
        blocknum: BlockNum,
        mode: PairLockType,
        unlocker: impl FnOnce(),
    ) -> Result<PinAttempt<V>> {
        let shared = self.shared();
        let key = PairKey::new(cf.filenum(), blocknum);
        let Some(pair) = shared.table.find(&key, key.fullhash()) else {
            if cf.is_closing() {
                return Err(CachetableError::CachefileClosing(cf.filenum()));
            }
            shared.schedule_fetch(&cf.inner, key);
            return try_again(unlocker, key, "not cached");
        };
        if !pair.lock.try_acquire(mode) {
            return try_again(unlocker, key, "locked");
        }
        if !pair.is_available() {
            pair.lock.release(mode);
            return try_again(unlocker, key, "removed");
        }
        if mode.is_write() {
            let written = {
                let _pending = shared.table.pending_lock.read();
                shared.checkpoint_locked_pair(&pair, mode, false)
            };
            if !written {
                pair.lock.release(mode);
                shared.schedule_checkpoint_write(pair);
                return try_again(unlocker, key, "checkpoint write needed");
            }
        }
        if needs_partial_fetch(&pair) {
            pair.lock.release(mode);
            shared.schedule_partial_fetch(pair);
            return try_again(unlocker, key, "partial fetch needed");
        }
        pair.touch();
        shared.stats.hits.fetch_add(1, Ordering::Relaxed);
        Ok(PinAttempt::Pinned(PinnedPair::new(shared, pair, mode)))
    }

    /// Pin a block only if that needs neither I/O nor waiting
    ///
    /// Write pins are only granted on pairs that are already dirty and not
    /// pending for a checkpoint.
    pub fn maybe_get_and_pin(
        &self,
        cf: &Cachefile<V>,
        blocknum: BlockNum,
        mode: PairLockType,
    ) -> Result<Option<PinnedPair<V>>> {
        self.maybe_pin(cf, blocknum, mode, true)
    }

    /// Like [`Cachetable::maybe_get_and_pin`], also granting write pins on clean pairs
    pub fn maybe_get_and_pin_clean(
        &self,
        cf: &Cachefile<V>,
        blocknum: BlockNum,
        mode: PairLockType,
    ) -> Result<Option<PinnedPair<V>>> {
        self.maybe_pin(cf, blocknum, mode, false)
    }

    fn maybe_pin(
        &self,
        cf: &Cachefile<V>,
        blocknum: BlockNum,
        mode: PairLockType,
        require_dirty: bool,
    ) -> Result<Option<PinnedPair<V>>> {
        if cf.is_closing() {
            return Err(CachetableError::CachefileClosing(cf.filenum()));
        }
        let shared = self.shared();
        let key = PairKey::new(cf.filenum(), blocknum);
        let Some(pair) = shared.table.find(&key, key.fullhash()) else {
            return Ok(None);
        };
        if !pair.lock.try_acquire(mode) {
            return Ok(None);
        }
        let usable = pair.is_available()
            && (!mode.is_write() || {
                let _pending = shared.table.pending_lock.read();
                let meta = pair.meta();
                !meta.checkpoint_pending && (!require_dirty || meta.dirty.is_dirty())
            })
            && !needs_partial_fetch(&pair);
        if !usable {
            pair.lock.release(mode);
            return Ok(None);
        }
        pair.touch();
        shared.stats.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(PinnedPair::new(shared, pair, mode)))
    }

    /// Release a pin; see [`PinnedPair::unpin`]
    pub fn unpin(&self, pinned: PinnedPair<V>, dirty: CacheDirty, attr: PairAttr) {
        assert!(
            Arc::ptr_eq(&pinned.shared, self.shared()),
            "pair pinned in another cachetable"
        );
        pinned.unpin(dirty, attr);
    }

    /// Remove a write-pinned pair; see [`PinnedPair::unpin_and_remove`]
    pub fn unpin_and_remove(&self, pinned: PinnedPair<V>, on_removed: impl FnOnce(BlockNum, bool)) {
        assert!(
            Arc::ptr_eq(&pinned.shared, self.shared()),
            "pair pinned in another cachetable"
        );
        pinned.unpin_and_remove(on_removed);
    }

    /// Insert a new block, returned dirty and pinned `WriteExpensive`
    pub fn put(
        &self,
        cf: &Cachefile<V>,
        blocknum: BlockNum,
        value: V,
        attr: PairAttr,
    ) -> Result<PinnedPair<V>> {
        if cf.is_closing() {
            return Err(CachetableError::CachefileClosing(cf.filenum()));
        }
        let shared = self.shared();
        let key = PairKey::new(cf.filenum(), blocknum);
        let attr = if attr.is_valid { attr } else { PairAttr::new(0) };
        shared.wait_for_cache_pressure();
        let (pair, inserted) = shared.table.find_or_insert(key, key.fullhash(), |slot| {
            Pair::inserted(key, slot, Arc::clone(&cf.inner), value, attr)
        });
        if !inserted {
            return Err(CachetableError::KeyExists {
                filenum: key.filenum,
                blocknum,
            });
        }
        shared.evictor.add_pair_attr(&attr);
        shared.maybe_wake_evictor();
        Ok(PinnedPair::new(shared, pair, PairLockType::WriteExpensive))
    }

    /// Start reading a block (or completing a partial one) in the background
    ///
    /// Returns whether any I/O was scheduled. Closing the cachefile waits
    /// for the prefetch to finish.
    pub fn prefetch(&self, cf: &Cachefile<V>, blocknum: BlockNum) -> Result<bool> {
        if cf.is_closing() {
            return Ok(false);
        }
        let shared = self.shared();
        let key = PairKey::new(cf.filenum(), blocknum);
        let Some(pair) = shared.table.find(&key, key.fullhash()) else {
            return Ok(shared.schedule_fetch(&cf.inner, key));
        };
        if !pair.lock.try_acquire(PairLockType::WriteExpensive) {
            return Ok(false);
        }
        let needs_pf = pair.is_available() && needs_partial_fetch(&pair);
        pair.lock.release(PairLockType::WriteExpensive);
        if !needs_pf {
            return Ok(false);
        }
        shared.stats.prefetches.fetch_add(1, Ordering::Relaxed);
        Ok(shared.schedule_partial_fetch(pair))
    }

    /// Recorded footprint of a cached block
    pub fn get_attr(&self, cf: &Cachefile<V>, blocknum: BlockNum) -> Option<PairAttr> {
        let key = PairKey::new(cf.filenum(), blocknum);
        self.shared()
            .table
            .find(&key, key.fullhash())
            .map(|pair| pair.attr())
    }

    /// Check every internal invariant
    ///
    /// # Panics
    ///
    /// Panics on the first inconsistency found.
    pub fn verify(&self) {
        let shared = self.shared();
        let classes = shared.table.verify(shared.evictor.size_current());
        assert_eq!(classes, shared.evictor.size_classes(), "size class accounting drifted");
    }

    pub fn status(&self) -> CachetableStatus {
        let shared = self.shared();
        let mut status = CachetableStatus::from_counters(&shared.stats);
        status.size_current = shared.evictor.size_current();
        status.size_limit = shared.evictor.size_limit();
        status.size_evicting = shared.evictor.size_evicting();
        status.size_cloned = shared.evictor.size_cloned();
        let classes = shared.evictor.size_classes();
        status.size_nonleaf = classes.nonleaf_size;
        status.size_leaf = classes.leaf_size;
        status.size_rollback = classes.rollback_size;
        status.size_cachepressure = classes.cache_pressure_size;
        status.cleaner_period_ms = shared.config.cleaner.period_ms;
        status.cleaner_iterations = shared.config.cleaner.iterations;
        status.pair_count = shared.table.len();
        status.client_pool = shared.client_pool.status();
        status.cachetable_pool = shared.cachetable_pool.status();
        status.checkpoint_pool = shared.checkpoint_pool.status();
        status.checkpoint = shared.checkpoint.status();
        status
    }

    /// Live counters
    pub fn stats(&self) -> &CachetableStats {
        &self.shared().stats
    }

    pub fn checkpointer(&self) -> Checkpointer<V> {
        Checkpointer {
            shared: Arc::clone(self.shared()),
        }
    }

    pub fn begin_checkpoint(&self, lsn: Lsn) -> Result<()> {
        self.shared().begin_checkpoint(lsn)
    }

    pub fn end_checkpoint(&self) -> Result<()> {
        self.shared().end_checkpoint()
    }

    /// Take a checkpoint every `checkpoint.period_ms` at the LSN
    /// `lsn_source` returns when one is due
    pub fn start_periodic_checkpoints(
        &self,
        lsn_source: impl Fn() -> Lsn + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared().start_periodic_checkpoints(Box::new(lsn_source))
    }

    /// Wake the eviction thread
    pub fn signal_eviction_thread(&self) {
        self.shared().evictor.signal();
    }

    /// Wake the eviction thread and wait for the pass and its background
    /// evictions to finish
    pub fn signal_eviction_thread_and_wait(&self) {
        self.shared().evictor.signal_and_wait();
    }

    /// Run the cleaner now; returns how many pairs it cleaned
    pub fn run_cleaner(&self) -> usize {
        self.shared().run_cleaner()
    }

    pub fn pair_count(&self) -> usize {
        self.shared().table.len()
    }

    pub fn size_current(&self) -> i64 {
        self.shared().evictor.size_current()
    }

    /// Pairs in the order the clock hand will visit them
    pub fn pairs_in_eviction_order(&self) -> Vec<PairInfo> {
        let mut out = Vec::new();
        self.shared()
            .table
            .for_each_in_eviction_order(|pair| out.push(pair.info()));
        out
    }

    /// Pairs ordered by file and block number
    pub fn pairs_in_layout_order(&self) -> Vec<PairInfo> {
        let mut out = Vec::new();
        self.shared()
            .table
            .for_each_in_layout_order(|pair| out.push(pair.info()));
        out
    }

    /// Pairs pending for the checkpoint in progress
    pub fn pending_pairs(&self) -> Vec<PairInfo> {
        let mut out = Vec::new();
        self.shared()
            .table
            .for_each_pending(|pair| out.push(pair.info()));
        out
    }

    /// Close every cachefile still open and stop the background threads
    pub fn close(&self) -> Result<()> {
        let shared = self.shared();
        if shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        shared.checkpoint.stop_periodic();
        let mut first_error = None;
        for cf in shared.cachefiles.release_all() {
            warn!("Cachefile {} still open at cachetable close", cf.filenum());
            if let Err(e) = shared.close_cachefile_inner(&cf) {
                first_error.get_or_insert(e);
            }
        }
        shared.stop_threads();
        info!("Closed cachetable");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::tests::NumberCallbacks;
    use tempfile::TempDir;

    fn setup(limit: u64) -> (TempDir, Cachetable<u64>, Cachefile<u64>) {
        let dir = TempDir::new().unwrap();
        let ct = Cachetable::new(CachetableConfig::for_testing(limit)).unwrap();
        let cf = ct
            .open_cachefile(dir.path().join("numbers"), Arc::new(NumberCallbacks))
            .unwrap();
        (dir, ct, cf)
    }

    #[test]
    fn test_miss_then_hit() {
        let (_dir, ct, cf) = setup(100);
        let pinned = ct.get_and_pin(&cf, BlockNum::new(7), PairLockType::Read).unwrap();
        assert_eq!(*pinned.value(), 7);
        assert_eq!(pinned.attr().size, 1);
        pinned.unpin(CacheDirty::Clean, PairAttr::invalid());

        let pinned = ct.get_and_pin(&cf, BlockNum::new(7), PairLockType::Read).unwrap();
        pinned.unpin(CacheDirty::Clean, PairAttr::invalid());

        let status = ct.status();
        assert_eq!(status.misses, 1);
        assert_eq!(status.hits, 1);
        assert_eq!(status.pair_count, 1);
        assert_eq!(status.size_current, 1);
        ct.verify();
        ct.close().unwrap();
    }

    #[test]
    fn test_put_existing_key_fails() {
        let (_dir, ct, cf) = setup(100);
        let pinned = ct.put(&cf, BlockNum::new(1), 10, PairAttr::new(2)).unwrap();
        assert!(pinned.is_dirty());
        assert_eq!(pinned.lock_type(), PairLockType::WriteExpensive);
        assert!(matches!(
            ct.put(&cf, BlockNum::new(1), 11, PairAttr::new(2)),
            Err(CachetableError::KeyExists { .. })
        ));
        pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());
        assert_eq!(ct.size_current(), 2);
        ct.verify();
    }

    #[test]
    fn test_status_reports_size_classes() {
        let (_dir, ct, cf) = setup(100);
        let leaf = PairAttr::new(4).with_leaf_size(4).with_cache_pressure(2);
        ct.put(&cf, BlockNum::new(1), 1, leaf)
            .unwrap()
            .unpin(CacheDirty::Dirty, PairAttr::invalid());
        let rollback = PairAttr::new(3).with_rollback_size(3);
        ct.put(&cf, BlockNum::new(2), 2, rollback)
            .unwrap()
            .unpin(CacheDirty::Dirty, PairAttr::invalid());

        let pinned = ct
            .get_and_pin(&cf, BlockNum::new(1), PairLockType::WriteCheap)
            .unwrap();
        pinned.unpin(CacheDirty::Dirty, PairAttr::new(6).with_nonleaf_size(6));

        let status = ct.status();
        assert_eq!(status.size_current, 9);
        assert_eq!(status.size_nonleaf, 6);
        assert_eq!(status.size_leaf, 0);
        assert_eq!(status.size_rollback, 3);
        assert_eq!(status.size_cachepressure, 0);
        assert_eq!(status.cleaner_period_ms, 0);
        assert_eq!(status.cleaner_iterations, 5);
        ct.verify();

        let pinned = ct
            .get_and_pin(&cf, BlockNum::new(2), PairLockType::WriteExpensive)
            .unwrap();
        pinned.unpin_and_remove(|_, _| {});
        assert_eq!(ct.status().size_rollback, 0);
        ct.verify();
    }

    #[test]
    fn test_dropped_pin_is_released() {
        let (_dir, ct, cf) = setup(100);
        {
            let _pinned = ct
                .get_and_pin(&cf, BlockNum::new(3), PairLockType::WriteExpensive)
                .unwrap();
        }
        let attempt = ct
            .get_and_pin_nonblocking(&cf, BlockNum::new(3), PairLockType::WriteExpensive, || {
                panic!("unlocker must not run")
            })
            .unwrap();
        let pinned = attempt.pinned().unwrap();
        pinned.unpin(CacheDirty::Clean, PairAttr::invalid());
    }

    #[test]
    fn test_write_pin_updates_value_and_size() {
        let (_dir, ct, cf) = setup(100);
        let mut pinned = ct
            .get_and_pin(&cf, BlockNum::new(5), PairLockType::WriteCheap)
            .unwrap();
        *pinned.value_mut() = 50;
        pinned.unpin(CacheDirty::Dirty, PairAttr::new(4));
        assert_eq!(ct.get_attr(&cf, BlockNum::new(5)).unwrap().size, 4);
        assert_eq!(ct.size_current(), 4);

        let pinned = ct.get_and_pin(&cf, BlockNum::new(5), PairLockType::Read).unwrap();
        assert_eq!(*pinned.value(), 50);
        assert!(pinned.is_dirty());
        pinned.unpin(CacheDirty::Clean, PairAttr::invalid());
    }

    #[test]
    #[should_panic(expected = "pinned for reading")]
    fn test_read_pin_cannot_mutate() {
        let (_dir, ct, cf) = setup(100);
        let mut pinned = ct.get_and_pin(&cf, BlockNum::new(1), PairLockType::Read).unwrap();
        let _ = pinned.value_mut();
    }

    #[test]
    fn test_maybe_pin_requires_dirty_for_write() {
        let (_dir, ct, cf) = setup(100);
        assert!(ct
            .maybe_get_and_pin(&cf, BlockNum::new(2), PairLockType::Read)
            .unwrap()
            .is_none());

        let pinned = ct.get_and_pin(&cf, BlockNum::new(2), PairLockType::Read).unwrap();
        pinned.unpin(CacheDirty::Clean, PairAttr::invalid());

        assert!(ct
            .maybe_get_and_pin(&cf, BlockNum::new(2), PairLockType::WriteCheap)
            .unwrap()
            .is_none());
        let clean = ct
            .maybe_get_and_pin_clean(&cf, BlockNum::new(2), PairLockType::WriteCheap)
            .unwrap()
            .unwrap();
        clean.unpin(CacheDirty::Dirty, PairAttr::invalid());

        let dirty = ct
            .maybe_get_and_pin(&cf, BlockNum::new(2), PairLockType::WriteCheap)
            .unwrap()
            .unwrap();
        assert!(ct
            .maybe_get_and_pin(&cf, BlockNum::new(2), PairLockType::Read)
            .unwrap()
            .is_none());
        dirty.unpin(CacheDirty::Clean, PairAttr::invalid());
    }

    #[test]
    fn test_unpin_and_remove_reports_blocknum() {
        let (_dir, ct, cf) = setup(100);
        let pinned = ct.put(&cf, BlockNum::new(9), 9, PairAttr::new(3)).unwrap();
        let mut removed = None;
        pinned.unpin_and_remove(|blocknum, pending| removed = Some((blocknum, pending)));
        assert_eq!(removed, Some((BlockNum::new(9), false)));
        assert_eq!(ct.pair_count(), 0);
        assert_eq!(ct.size_current(), 0);
        assert!(ct.get_attr(&cf, BlockNum::new(9)).is_none());
        ct.verify();
    }

    #[test]
    fn test_closed_cachefile_rejects_pins() {
        let (_dir, ct, cf) = setup(100);
        let pinned = ct.put(&cf, BlockNum::new(1), 1, PairAttr::new(1)).unwrap();
        pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());
        let handle = cf.clone();
        ct.close_cachefile(cf).unwrap();
        assert_eq!(ct.pair_count(), 0);
        assert!(matches!(
            ct.get_and_pin(&handle, BlockNum::new(1), PairLockType::Read),
            Err(CachetableError::CachefileClosing(_))
        ));
        assert!(!ct.prefetch(&handle, BlockNum::new(2)).unwrap());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dir, ct, _cf) = setup(100);
        ct.close().unwrap();
        ct.close().unwrap();
    }
}
