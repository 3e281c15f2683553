//! Checkpointer: begin/end protocol and checkpoint writeback
//!
//! `begin_checkpoint` marks every dirty pair pending. From then on each
//! pending pair is written exactly once for the checkpoint, by whichever
//! comes first: a client pinning it for writing, a client unpinning it,
//! the evictor or a cachefile close evicting it, or `end_checkpoint`
//! walking the pending set. A pair held `WriteCheap` is written through a
//! clone on the checkpoint kibbutz so the holder can keep going; otherwise
//! the live value is flushed directly.
//!
//! Checkpoints are normally driven by the write-ahead log. Once started,
//! a checkpoint thread can also take one every `checkpoint.period_ms`.

use crate::cachefile::CachefileInner;
use crate::cachetable::Shared;
use crate::callbacks::{CacheValue, Cloned, FlushArgs};
use crate::pair::Pair;
use cachetable_common::{
    CacheDirty, CachetableError, CheckpointConfig, Lsn, PairAttr, PairLockType, Result,
};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::status::micros;

/// Phase of the checkpoint state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CheckpointPhase {
    /// No checkpoint in progress
    Idle,
    /// Pairs are marked, waiting for `end_checkpoint`
    Begin,
    /// `end_checkpoint` is writing the remaining pending pairs
    Ending,
}

/// Checkpoint counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointStatus {
    /// Completed checkpoints
    pub checkpoints_taken: u64,
    /// LSN of the last completed checkpoint
    pub last_lsn: Lsn,
    /// Unix time the last checkpoint began
    pub last_begin_unix: u64,
    /// Unix time the last checkpoint finished marking pairs
    pub last_begin_complete_unix: u64,
    /// Unix time the last checkpoint ended
    pub last_end_unix: u64,
    /// Duration of the last checkpoint, begin to end (microseconds)
    pub last_duration_us: u64,
    /// Duration of all checkpoints (microseconds)
    pub total_duration_us: u64,
    /// Time spent in begin phases (microseconds)
    pub begin_time_us: u64,
    /// Begin phases longer than the configured threshold
    pub long_begin_count: u64,
    /// Time spent in end phases (microseconds)
    pub end_time_us: u64,
    /// End phases longer than the configured threshold
    pub long_end_count: u64,
    /// Pending pairs written for a checkpoint
    pub pairs_written: u64,
    /// Of those, written through a clone
    pub clone_writes: u64,
    /// Checkpoint thread period (milliseconds)
    pub period_ms: u64,
    /// Step the checkpoint in progress has reached, 0 when idle
    pub footprint: u64,
}

/// Footprint steps
const FOOTPRINT_BEGIN_HOOKS: u64 = 10;
const FOOTPRINT_MARK_PENDING: u64 = 11;
const FOOTPRINT_BEGIN_DONE: u64 = 20;
const FOOTPRINT_WRITE_PENDING: u64 = 30;
const FOOTPRINT_WAIT_CLONES: u64 = 31;
const FOOTPRINT_CHECKPOINT_FILES: u64 = 32;
const FOOTPRINT_END_HOOKS: u64 = 33;

/// Supplies the LSN for a periodic checkpoint
pub(crate) type LsnSource = Box<dyn Fn() -> Lsn + Send + Sync>;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

struct Progress<V> {
    phase: CheckpointPhase,
    lsn: Lsn,
    last_lsn: Lsn,
    began_at: Option<Instant>,
    cachefiles: Vec<Arc<CachefileInner<V>>>,
}

/// Checkpoint state owned by the cachetable
pub(crate) struct CheckpointState<V> {
    /// Serializes begin and end
    serial: Mutex<()>,
    progress: Mutex<Progress<V>>,
    clone_writes: Mutex<usize>,
    clone_writes_done: Condvar,
    status: Mutex<CheckpointStatus>,
    long_phase: Duration,
    period: Duration,
    periodic_stopped: Mutex<bool>,
    periodic_wake: Condvar,
    periodic_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<V: CacheValue> CheckpointState<V> {
    pub(crate) fn new(initial_lsn: Lsn, config: &CheckpointConfig) -> Self {
        Self {
            serial: Mutex::new(()),
            progress: Mutex::new(Progress {
                phase: CheckpointPhase::Idle,
                lsn: initial_lsn,
                last_lsn: initial_lsn,
                began_at: None,
                cachefiles: Vec::new(),
            }),
            clone_writes: Mutex::new(0),
            clone_writes_done: Condvar::new(),
            status: Mutex::new(CheckpointStatus {
                last_lsn: initial_lsn,
                period_ms: config.period_ms,
                ..CheckpointStatus::default()
            }),
            long_phase: Duration::from_millis(config.long_phase_ms),
            period: Duration::from_millis(config.period_ms),
            periodic_stopped: Mutex::new(false),
            periodic_wake: Condvar::new(),
            periodic_handle: Mutex::new(None),
        }
    }

    fn set_footprint(&self, step: u64) {
        self.status.lock().footprint = step;
    }

    /// Stop and join the checkpoint thread if it runs
    pub(crate) fn stop_periodic(&self) {
        *self.periodic_stopped.lock() = true;
        self.periodic_wake.notify_all();
        if let Some(handle) = self.periodic_handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn phase(&self) -> CheckpointPhase {
        self.progress.lock().phase
    }

    pub(crate) fn last_lsn(&self) -> Lsn {
        self.progress.lock().last_lsn
    }

    pub(crate) fn status(&self) -> CheckpointStatus {
        self.status.lock().clone()
    }

    pub(crate) fn record_pair_written(&self, cloned: bool) {
        let mut status = self.status.lock();
        status.pairs_written += 1;
        if cloned {
            status.clone_writes += 1;
        }
    }

    fn clone_write_started(&self) {
        *self.clone_writes.lock() += 1;
    }

    fn clone_write_finished(&self) {
        let mut writes = self.clone_writes.lock();
        *writes -= 1;
        if *writes == 0 {
            self.clone_writes_done.notify_all();
        }
    }

    fn wait_for_clone_writes(&self) {
        let mut writes = self.clone_writes.lock();
        while *writes > 0 {
            self.clone_writes_done.wait(&mut writes);
        }
    }
}

impl<V: CacheValue> Shared<V> {
    pub(crate) fn begin_checkpoint(&self, lsn: Lsn) -> Result<()> {
        let _serial = self.checkpoint.serial.lock();
        if self.checkpoint.phase() != CheckpointPhase::Idle {
            return Err(CachetableError::CheckpointInProgress);
        }
        let start = Instant::now();
        let begin_unix = unix_now();

        self.checkpoint.set_footprint(FOOTPRINT_BEGIN_HOOKS);
        let cachefiles = self.cachefiles.snapshot();
        for cf in &cachefiles {
            cf.callbacks().begin_checkpoint(lsn);
        }
        self.checkpoint.set_footprint(FOOTPRINT_MARK_PENDING);
        let marked = {
            let _pending = self.table.pending_lock.write();
            self.table.mark_dirty_pairs_pending()
        };

        {
            let mut progress = self.checkpoint.progress.lock();
            progress.phase = CheckpointPhase::Begin;
            progress.lsn = lsn;
            progress.began_at = Some(start);
            progress.cachefiles = cachefiles;
        }

        let elapsed = start.elapsed();
        {
            let mut status = self.checkpoint.status.lock();
            status.last_begin_unix = begin_unix;
            status.last_begin_complete_unix = unix_now();
            status.footprint = FOOTPRINT_BEGIN_DONE;
            status.begin_time_us += micros(elapsed);
            if elapsed >= self.checkpoint.long_phase {
                status.long_begin_count += 1;
                warn!("Checkpoint begin at LSN {} took {:?}", lsn, elapsed);
            }
        }
        info!(
            "Began checkpoint at LSN {}: {} of {} pairs pending",
            lsn,
            marked,
            self.table.len()
        );
        Ok(())
    }

    pub(crate) fn end_checkpoint(self: &Arc<Self>) -> Result<()> {
        let _serial = self.checkpoint.serial.lock();
        let start = Instant::now();
        let (lsn, began_at, cachefiles) = {
            let mut progress = self.checkpoint.progress.lock();
            if progress.phase != CheckpointPhase::Begin {
                return Err(CachetableError::NoCheckpointInProgress);
            }
            progress.phase = CheckpointPhase::Ending;
            (
                progress.lsn,
                progress.began_at.take(),
                std::mem::take(&mut progress.cachefiles),
            )
        };

        self.checkpoint.set_footprint(FOOTPRINT_WRITE_PENDING);
        let pending = self.table.pending_snapshot();
        debug!("Ending checkpoint at LSN {}: {} pairs still pending", lsn, pending.len());
        for pair in &pending {
            pair.lock.acquire(PairLockType::WriteCheap);
            if pair.is_available() {
                let _pending = self.table.pending_lock.read();
                self.checkpoint_locked_pair(pair, PairLockType::WriteCheap, true);
            }
            pair.lock.release(PairLockType::WriteCheap);
        }
        self.checkpoint.set_footprint(FOOTPRINT_WAIT_CLONES);
        self.checkpoint.wait_for_clone_writes();
        debug_assert_eq!(self.table.pending_len(), 0);

        self.checkpoint.set_footprint(FOOTPRINT_CHECKPOINT_FILES);

        for cf in cachefiles.iter().filter(|cf| !cf.is_closing()) {
            if let Err(e) = cf.callbacks().checkpoint(cf.file(), lsn) {
                error!(
                    "Checkpoint of cachefile {} at LSN {} failed: {}",
                    cf.filenum(),
                    lsn,
                    e
                );
                std::process::abort();
            }
        }
        self.checkpoint.set_footprint(FOOTPRINT_END_HOOKS);
        for cf in &cachefiles {
            cf.callbacks().end_checkpoint(lsn);
        }

        {
            let mut progress = self.checkpoint.progress.lock();
            progress.phase = CheckpointPhase::Idle;
            progress.last_lsn = lsn;
        }

        let elapsed = start.elapsed();
        let total = began_at.map_or(elapsed, |t| t.elapsed());
        {
            let mut status = self.checkpoint.status.lock();
            status.checkpoints_taken += 1;
            status.last_lsn = lsn;
            status.last_end_unix = unix_now();
            status.end_time_us += micros(elapsed);
            status.last_duration_us = micros(total);
            status.total_duration_us += micros(total);
            status.footprint = 0;
            if elapsed >= self.checkpoint.long_phase {
                status.long_end_count += 1;
                warn!("Checkpoint end at LSN {} took {:?}", lsn, elapsed);
            }
        }
        info!("Ended checkpoint at LSN {} in {:?}", lsn, total);
        Ok(())
    }

    /// Write a pair for the checkpoint in progress if it is pending
    ///
    /// The caller holds the pair in a write mode and `pending_lock` for
    /// reading. Under `WriteCheap` a cloneable value is written through a
    /// clone on the checkpoint kibbutz. Otherwise the live value is flushed
    /// here, unless `allow_direct` is false, in which case nothing happens
    /// and false is returned.
    pub(crate) fn checkpoint_locked_pair(
        self: &Arc<Self>,
        pair: &Arc<Pair<V>>,
        held: PairLockType,
        allow_direct: bool,
    ) -> bool {
        let (pending, dirty, attr, dirty_gen) = {
            let meta = pair.meta();
            (meta.checkpoint_pending, meta.dirty.is_dirty(), meta.attr, meta.dirty_gen)
        };
        if !pending || pair.lock.clone_flush_in_flight() {
            return true;
        }
        if !dirty {
            self.table.clear_pending(pair);
            return true;
        }

        let callbacks = pair.cachefile().callbacks();
        if held == PairLockType::WriteCheap {
            let cloned = callbacks.clone_value(&pair.read_value());
            if let Some(Cloned { value, size }) = cloned {
                pair.lock.begin_clone_flush();
                self.evictor.add_cloned(size);
                self.checkpoint.clone_write_started();
                let shared = Arc::clone(self);
                let pair = Arc::clone(pair);
                self.checkpoint_pool.enqueue(move || {
                    shared.write_clone(&pair, value, attr, dirty_gen, size);
                });
                return true;
            }
        }
        if !allow_direct {
            return false;
        }

        let args = FlushArgs {
            write_me: true,
            keep_me: true,
            for_checkpoint: true,
            is_clone: false,
        };
        let new_attr = self.flush_pair(pair, &pair.read_value(), attr, args);
        pair.meta().dirty = CacheDirty::Clean;
        self.set_pair_attr(pair, new_attr);
        self.table.clear_pending(pair);
        self.checkpoint.record_pair_written(false);
        true
    }

    fn write_clone(
        &self,
        pair: &Arc<Pair<V>>,
        value: V,
        attr: PairAttr,
        dirty_gen: u64,
        size: i64,
    ) {
        let args = FlushArgs {
            write_me: true,
            keep_me: true,
            for_checkpoint: true,
            is_clone: true,
        };
        self.flush_pair(pair, &value, attr, args);
        drop(value);
        {
            let mut meta = pair.meta();
            if meta.dirty_gen == dirty_gen {
                meta.dirty = CacheDirty::Clean;
            }
        }
        self.table.clear_pending(pair);
        self.evictor.add_cloned(-size);
        self.checkpoint.record_pair_written(true);
        pair.lock.end_clone_flush();
        self.checkpoint.clone_write_finished();
    }

    /// Start the checkpoint thread
    pub(crate) fn start_periodic_checkpoints(
        self: &Arc<Self>,
        lsn_source: LsnSource,
    ) -> Result<()> {
        let period = self.checkpoint.period;
        if period.is_zero() {
            return Err(CachetableError::configuration(
                "checkpoint period must be non-zero to take periodic checkpoints",
            ));
        }
        if *self.checkpoint.periodic_stopped.lock() {
            return Err(CachetableError::internal("cachetable is shutting down"));
        }
        let mut handle = self.checkpoint.periodic_handle.lock();
        if handle.is_some() {
            return Err(CachetableError::configuration(
                "periodic checkpoints are already running",
            ));
        }
        let thread_shared = Arc::clone(self);
        *handle = Some(
            thread::Builder::new()
                .name("ct-checkpointer".to_string())
                .spawn(move || thread_shared.run_periodic_checkpoints(period, &lsn_source))?,
        );
        Ok(())
    }

    fn run_periodic_checkpoints(self: &Arc<Self>, period: Duration, lsn_source: &LsnSource) {
        info!("Checkpoint thread started, period {:?}", period);
        loop {
            {
                let mut stopped = self.checkpoint.periodic_stopped.lock();
                if !*stopped {
                    self.checkpoint.periodic_wake.wait_for(&mut stopped, period);
                }
                if *stopped {
                    break;
                }
            }
            let lsn = lsn_source();
            match self.begin_checkpoint(lsn) {
                Ok(()) => {
                    if let Err(e) = self.end_checkpoint() {
                        warn!("Periodic checkpoint at LSN {} did not end: {}", lsn, e);
                    }
                }
                Err(CachetableError::CheckpointInProgress) => {
                    debug!("Skipping periodic checkpoint at LSN {}: one is in progress", lsn);
                }
                Err(e) => warn!("Periodic checkpoint at LSN {} failed: {}", lsn, e),
            }
        }
        info!("Checkpoint thread stopped");
    }

    /// Write a pending pair in the background, for a pin that must not block
    pub(crate) fn schedule_checkpoint_write(self: &Arc<Self>, pair: Arc<Pair<V>>) {
        let Some(job) = pair.cachefile().add_job() else {
            return;
        };
        let shared = Arc::clone(self);
        self.client_pool.enqueue(move || {
            pair.lock.acquire(PairLockType::WriteExpensive);
            if pair.is_available() {
                let _pending = shared.table.pending_lock.read();
                shared.checkpoint_locked_pair(&pair, PairLockType::WriteExpensive, true);
            }
            pair.lock.release(PairLockType::WriteExpensive);
            drop(job);
        });
    }
}

/// Handle the write-ahead log uses to drive checkpoints
pub struct Checkpointer<V: CacheValue> {
    pub(crate) shared: Arc<Shared<V>>,
}

impl<V: CacheValue> Clone for Checkpointer<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: CacheValue> Checkpointer<V> {
    /// Mark every dirty pair for a checkpoint at `lsn`
    pub fn begin_checkpoint(&self, lsn: Lsn) -> Result<()> {
        self.shared.begin_checkpoint(lsn)
    }

    /// Write every pair marked by the matching begin and finish the checkpoint
    pub fn end_checkpoint(&self) -> Result<()> {
        self.shared.end_checkpoint()
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.shared.checkpoint.phase()
    }

    /// LSN of the last completed checkpoint
    pub fn last_lsn(&self) -> Lsn {
        self.shared.checkpoint.last_lsn()
    }

    pub fn status(&self) -> CheckpointStatus {
        self.shared.checkpoint.status()
    }

    /// Take a checkpoint every `checkpoint.period_ms` at the LSN
    /// `lsn_source` returns when one is due
    pub fn start_periodic(
        &self,
        lsn_source: impl Fn() -> Lsn + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared.start_periodic_checkpoints(Box::new(lsn_source))
    }
}
