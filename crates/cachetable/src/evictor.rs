//! Evictor: size accounting, watermarks and the eviction thread
//!
//! The evictor tracks three sizes. `size_current` is the sum of every
//! resident pair's `attr.size`; `size_evicting` is what in-flight background
//! evictions are about to release; `size_cloned` is held by checkpoint
//! clones waiting to be written. Alongside `size_current` it keeps the
//! per-class totals (nonleaf, leaf, rollback, cache pressure) for status.
//!
//! A pass walks the clock ring. A warm pair (clock count above zero) is aged
//! one step and may be partially evicted; a cold pair is fully evicted,
//! dirty ones on the cachetable kibbutz. The pass stops as soon as the
//! unreserved size is back under the limit, or after a full sweep that
//! changed nothing.

use crate::cachetable::Shared;
use crate::callbacks::{CacheValue, FlushArgs, PartialEvictionCost};
use crate::cachefile::BackgroundJob;
use crate::pair::Pair;
use cachetable_common::{CachetableConfig, PairAttr, PairLockType};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

fn percent_of(limit: u64, pct: u32) -> i64 {
    let scaled = u128::from(limit) * u128::from(pct) / 100;
    i64::try_from(scaled).unwrap_or(i64::MAX)
}

/// Resident bytes by node class
#[derive(Debug, Default)]
pub(crate) struct SizeClasses {
    nonleaf: AtomicI64,
    leaf: AtomicI64,
    rollback: AtomicI64,
    cache_pressure: AtomicI64,
}

impl SizeClasses {
    fn add(&self, attr: &PairAttr, sign: i64) {
        self.nonleaf.fetch_add(sign * attr.nonleaf_size, Ordering::AcqRel);
        self.leaf.fetch_add(sign * attr.leaf_size, Ordering::AcqRel);
        self.rollback.fetch_add(sign * attr.rollback_size, Ordering::AcqRel);
        self.cache_pressure.fetch_add(sign * attr.cache_pressure_size, Ordering::AcqRel);
    }

    /// Totals as one attribute; `size` is left at zero
    pub(crate) fn snapshot(&self) -> PairAttr {
        PairAttr::new(0)
            .with_nonleaf_size(self.nonleaf.load(Ordering::Acquire))
            .with_leaf_size(self.leaf.load(Ordering::Acquire))
            .with_rollback_size(self.rollback.load(Ordering::Acquire))
            .with_cache_pressure(self.cache_pressure.load(Ordering::Acquire))
    }
}

#[derive(Debug, Default)]
struct EvictorState {
    signaled: bool,
    shutdown: bool,
    sleepers: usize,
    requested_pass: u64,
    completed_pass: u64,
    evictions_in_flight: usize,
}

/// Eviction bookkeeping and thread control
pub(crate) struct Evictor {
    size_current: AtomicI64,
    size_evicting: AtomicI64,
    size_cloned: AtomicI64,
    classes: SizeClasses,
    low_watermark: i64,
    low_hysteresis: i64,
    high_hysteresis: i64,
    high_watermark: i64,
    enabled: bool,
    period: Duration,
    running: AtomicBool,
    state: Mutex<EvictorState>,
    /// Wakes the eviction thread
    wake: Condvar,
    /// Releases clients blocked on cache pressure
    flow: Condvar,
    /// Completed passes and finished background evictions
    progress: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Evictor {
    pub(crate) fn new(config: &CachetableConfig) -> Self {
        let ev = &config.evictor;
        Self {
            size_current: AtomicI64::new(0),
            size_evicting: AtomicI64::new(0),
            size_cloned: AtomicI64::new(0),
            classes: SizeClasses::default(),
            low_watermark: percent_of(config.size_limit, 100),
            low_hysteresis: percent_of(config.size_limit, ev.low_hysteresis_pct),
            high_hysteresis: percent_of(config.size_limit, ev.high_hysteresis_pct),
            high_watermark: percent_of(config.size_limit, ev.high_watermark_pct),
            enabled: ev.enabled,
            period: Duration::from_millis(ev.period_ms),
            running: AtomicBool::new(false),
            state: Mutex::new(EvictorState::default()),
            wake: Condvar::new(),
            flow: Condvar::new(),
            progress: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    /// Charge a pair that became resident
    pub(crate) fn add_pair_attr(&self, attr: &PairAttr) {
        self.size_current.fetch_add(attr.size, Ordering::AcqRel);
        self.classes.add(attr, 1);
    }

    /// Release a pair that left the cache
    pub(crate) fn remove_pair_attr(&self, attr: &PairAttr) {
        self.size_current.fetch_add(-attr.size, Ordering::AcqRel);
        self.classes.add(attr, -1);
    }

    pub(crate) fn change_pair_attr(&self, old: &PairAttr, new: &PairAttr) {
        self.size_current.fetch_add(new.size - old.size, Ordering::AcqRel);
        self.classes.add(old, -1);
        self.classes.add(new, 1);
    }

    pub(crate) fn size_classes(&self) -> PairAttr {
        self.classes.snapshot()
    }

    pub(crate) fn add_evicting(&self, delta: i64) {
        self.size_evicting.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn add_cloned(&self, delta: i64) {
        self.size_cloned.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn size_current(&self) -> i64 {
        self.size_current.load(Ordering::Acquire)
    }

    pub(crate) fn size_evicting(&self) -> i64 {
        self.size_evicting.load(Ordering::Acquire)
    }

    pub(crate) fn size_cloned(&self) -> i64 {
        self.size_cloned.load(Ordering::Acquire)
    }

    pub(crate) fn size_limit(&self) -> i64 {
        self.low_watermark
    }

    fn unreserved(&self) -> i64 {
        self.size_current() - self.size_evicting()
    }

    /// The current pass should keep going
    pub(crate) fn eviction_needed(&self) -> bool {
        self.unreserved() > self.low_watermark
    }

    /// A client finding this should signal the eviction thread
    pub(crate) fn should_client_wake(&self) -> bool {
        self.enabled
            && !self.running.load(Ordering::Acquire)
            && self.unreserved() > self.low_hysteresis
    }

    /// A client about to add data should block first
    pub(crate) fn should_client_sleep(&self) -> bool {
        self.enabled && self.size_current() + self.size_cloned() > self.high_watermark
    }

    fn should_sleepers_wake(&self) -> bool {
        self.size_current() <= self.high_hysteresis
    }

    /// Wake the eviction thread
    pub(crate) fn signal(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        state.requested_pass += 1;
        self.wake.notify_one();
    }

    /// Wake the thread and wait until a pass that started after this call
    /// has finished, together with every background eviction
    pub(crate) fn signal_and_wait(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        state.requested_pass += 1;
        let target = state.requested_pass;
        self.wake.notify_one();
        while !state.shutdown
            && (state.completed_pass < target || state.evictions_in_flight > 0)
        {
            self.progress.wait(&mut state);
        }
    }

    /// Block a client until the evictor reports progress; returns the time waited
    pub(crate) fn wait_for_pressure_to_subside(&self) -> Duration {
        let start = Instant::now();
        let mut state = self.state.lock();
        if state.shutdown {
            return Duration::ZERO;
        }
        state.sleepers += 1;
        state.signaled = true;
        state.requested_pass += 1;
        self.wake.notify_one();
        self.flow.wait(&mut state);
        state.sleepers -= 1;
        start.elapsed()
    }

    fn release_sleepers_if_room(&self) {
        if self.should_sleepers_wake() {
            let state = self.state.lock();
            if state.sleepers > 0 {
                self.flow.notify_all();
            }
        }
    }

    pub(crate) fn eviction_started(&self) {
        self.state.lock().evictions_in_flight += 1;
    }

    pub(crate) fn eviction_finished(&self) {
        let mut state = self.state.lock();
        state.evictions_in_flight -= 1;
        self.progress.notify_all();
    }

    /// Start the eviction thread
    pub(crate) fn start<V: CacheValue>(shared: &Arc<Shared<V>>) -> std::io::Result<()> {
        let thread_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("ct-evictor".to_string())
            .spawn(move || thread_shared.evictor.run(&thread_shared))?;
        *shared.evictor.handle.lock() = Some(handle);
        Ok(())
    }

    fn run<V: CacheValue>(&self, shared: &Arc<Shared<V>>) {
        info!("Eviction thread started (enabled: {})", self.enabled);
        loop {
            let pass = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        info!("Eviction thread stopped");
                        return;
                    }
                    if state.signaled {
                        break;
                    }
                    if self.enabled {
                        if self.wake.wait_for(&mut state, self.period).timed_out() {
                            break;
                        }
                    } else {
                        self.wake.wait(&mut state);
                    }
                }
                state.signaled = false;
                self.running.store(true, Ordering::Release);
                state.requested_pass
            };

            shared.run_eviction();

            let mut state = self.state.lock();
            self.running.store(false, Ordering::Release);
            state.completed_pass = state.completed_pass.max(pass);
            if state.sleepers > 0 {
                self.flow.notify_all();
            }
            self.progress.notify_all();
        }
    }

    /// Stop and join the thread, releasing anyone waiting on it
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            self.wake.notify_all();
            self.flow.notify_all();
            self.progress.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<V: CacheValue> Shared<V> {
    /// One eviction pass
    pub(crate) fn run_eviction(self: &Arc<Self>) {
        let start = Instant::now();
        let before = self.evictor.size_current();
        let mut examined = 0usize;
        let mut idle = 0usize;
        while self.evictor.eviction_needed() {
            self.evictor.release_sleepers_if_room();
            let live = self.table.len();
            if live == 0 || idle >= live {
                break;
            }
            let Some(pair) = self.table.advance_clock_hand() else {
                break;
            };
            examined += 1;
            if self.run_eviction_on_pair(pair) {
                idle = 0;
            } else {
                idle += 1;
            }
        }
        if examined > 0 {
            debug!(
                "Eviction pass examined {} pairs, size {} -> {} ({} evicting) in {:?}",
                examined,
                before,
                self.evictor.size_current(),
                self.evictor.size_evicting(),
                start.elapsed()
            );
        }
    }

    /// Age or evict one pair; false if the pair could not be touched
    fn run_eviction_on_pair(self: &Arc<Self>, pair: Arc<Pair<V>>) -> bool {
        let Some(job) = pair.cachefile().add_job() else {
            return false;
        };
        if !pair.lock.try_acquire(PairLockType::WriteExpensive) {
            return false;
        }
        if !pair.is_available() {
            pair.lock.release(PairLockType::WriteExpensive);
            return false;
        }
        if pair.age() > 0 {
            self.try_partial_eviction(pair, job);
        } else {
            self.evict_cold_pair(pair, job);
        }
        true
    }

    fn try_partial_eviction(self: &Arc<Self>, pair: Arc<Pair<V>>, job: BackgroundJob) {
        let attr = pair.attr();
        let estimate = pair
            .cachefile()
            .callbacks()
            .pe_estimate(&pair.read_value(), attr);
        if estimate.bytes_freeable <= 0 {
            pair.lock.release(PairLockType::WriteExpensive);
            return;
        }
        match estimate.cost {
            PartialEvictionCost::Cheap => {
                self.partial_evict_locked_pair(&pair);
                pair.lock.release(PairLockType::WriteExpensive);
            }
            PartialEvictionCost::Expensive => {
                let reserved = estimate.bytes_freeable;
                self.evictor.add_evicting(reserved);
                self.evictor.eviction_started();
                let shared = Arc::clone(self);
                self.cachetable_pool.enqueue(move || {
                    shared.partial_evict_locked_pair(&pair);
                    shared.evictor.add_evicting(-reserved);
                    pair.lock.release(PairLockType::WriteExpensive);
                    drop(job);
                    shared.evictor.eviction_finished();
                });
            }
        }
    }

    fn partial_evict_locked_pair(&self, pair: &Pair<V>) {
        let old = pair.attr();
        let new = {
            let mut value = pair.write_value();
            pair.cachefile().callbacks().pe_execute(&mut value, old)
        };
        self.set_pair_attr(pair, new);
        self.stats.partial_evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn evict_cold_pair(self: &Arc<Self>, pair: Arc<Pair<V>>, job: BackgroundJob) {
        let (dirty, size) = {
            let meta = pair.meta();
            (meta.dirty.is_dirty(), meta.attr.size)
        };
        if !dirty {
            self.evict_locked_pair(&pair);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.evictor.add_evicting(size);
        self.evictor.eviction_started();
        let shared = Arc::clone(self);
        self.cachetable_pool.enqueue(move || {
            shared.evict_locked_pair(&pair);
            shared.stats.evictions.fetch_add(1, Ordering::Relaxed);
            shared.evictor.add_evicting(-size);
            drop(job);
            shared.evictor.eviction_finished();
        });
    }

    /// Write the pair if dirty, remove it and release its lock
    ///
    /// The caller holds the pair `WriteExpensive`.
    pub(crate) fn evict_locked_pair(&self, pair: &Arc<Pair<V>>) {
        {
            let _pending = self.table.pending_lock.read();
            let (attr, dirty, pending) = {
                let meta = pair.meta();
                (meta.attr, meta.dirty.is_dirty(), meta.checkpoint_pending)
            };
            let args = FlushArgs {
                write_me: dirty,
                keep_me: false,
                for_checkpoint: pending,
                is_clone: false,
            };
            self.flush_pair(pair, &pair.read_value(), attr, args);
            if pending && dirty {
                self.checkpoint.record_pair_written(false);
            }
            self.remove_pair(pair);
        }
        pair.lock.release(PairLockType::WriteExpensive);
    }
}
