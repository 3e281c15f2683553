//! Cleaner thread
//!
//! Periodically picks the pair with the most cache pressure among a small
//! sample of the clock ring and hands it to its cachefile's `cleaner`
//! callback, which does deferred maintenance (for example flushing buffered
//! messages down the tree) while the pair is pinned `WriteExpensive`.

use crate::cachetable::Shared;
use crate::callbacks::CacheValue;
use cachetable_common::{CacheDirty, CleanerConfig, PairAttr, PairLockType};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ring slots examined per cleaner iteration
pub(crate) const CLEANER_SAMPLE: usize = 8;

pub(crate) struct Cleaner {
    period: Duration,
    iterations: usize,
    stopped: Mutex<bool>,
    wake: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Cleaner {
    pub(crate) fn new(config: &CleanerConfig) -> Self {
        Self {
            period: Duration::from_millis(config.period_ms),
            iterations: config.iterations,
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start the periodic thread; a zero period leaves the cleaner manual
    pub(crate) fn start<V: CacheValue>(shared: &Arc<Shared<V>>) -> std::io::Result<()> {
        if shared.cleaner.period.is_zero() {
            return Ok(());
        }
        let thread_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("ct-cleaner".to_string())
            .spawn(move || {
                let cleaner = &thread_shared.cleaner;
                info!("Cleaner thread started, period {:?}", cleaner.period);
                loop {
                    {
                        let mut stopped = cleaner.stopped.lock();
                        if !*stopped {
                            cleaner.wake.wait_for(&mut stopped, cleaner.period);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    thread_shared.run_cleaner();
                }
                info!("Cleaner thread stopped");
            })?;
        *shared.cleaner.handle.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<V: CacheValue> Shared<V> {
    /// Run up to `iterations` cleaner callbacks; returns how many ran
    pub(crate) fn run_cleaner(self: &Arc<Self>) -> usize {
        let mut executed = 0;
        for _ in 0..self.cleaner.iterations {
            let Some(pair) = self.table.pick_cleaner_candidate(CLEANER_SAMPLE) else {
                break;
            };
            let Some(_job) = pair.cachefile().add_job() else {
                continue;
            };
            if !pair.lock.try_acquire(PairLockType::WriteExpensive) {
                continue;
            }
            if !pair.is_available() {
                pair.lock.release(PairLockType::WriteExpensive);
                continue;
            }
            {
                let _pending = self.table.pending_lock.read();
                self.checkpoint_locked_pair(&pair, PairLockType::WriteExpensive, true);
            }

            let attr = pair.attr();
            let outcome = {
                let mut value = pair.write_value();
                pair.cachefile()
                    .callbacks()
                    .cleaner(pair.blocknum(), &mut value, attr)
            };
            let (dirty, attr) = match outcome {
                Ok(outcome) => (outcome.dirty, outcome.attr),
                Err(e) => {
                    warn!(
                        "Cleaner failed on block {} of cachefile {}: {}",
                        pair.blocknum(),
                        pair.key().filenum,
                        e
                    );
                    (CacheDirty::Clean, PairAttr::invalid())
                }
            };
            self.unpin_pair(&pair, PairLockType::WriteExpensive, dirty, attr);
            self.stats.cleaner_executions.fetch_add(1, Ordering::Relaxed);
            executed += 1;
        }
        if executed > 0 {
            debug!("Cleaner ran on {} pairs", executed);
        }
        executed
    }
}
