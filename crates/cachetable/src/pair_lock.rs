//! Reader/writer lock guarding one cached pair
//!
//! Three acquisition strengths share one lock: `Read` holders run
//! concurrently, `WriteCheap` and `WriteExpensive` are exclusive. The two
//! write modes differ only in how they interact with a checkpoint clone
//! write: a cheap writer may hold the lock while the clone of the pair is
//! still being written, an expensive writer waits until that write is done.
//!
//! Waiting writers take priority over new readers, so a steady stream of
//! readers cannot starve a writer.
//!
//! The lock is not tied to a thread. A pair locked by a client may be
//! released by a background job and vice versa.

use cachetable_common::PairLockType;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: Option<PairLockType>,
    waiting_readers: u32,
    waiting_writers: u32,
    clone_flush: bool,
}

impl LockState {
    fn reader_blocked(&self) -> bool {
        self.writer.is_some() || self.waiting_writers > 0
    }

    fn writer_blocked(&self, mode: PairLockType) -> bool {
        self.readers > 0 || self.writer.is_some() || (mode.is_expensive() && self.clone_flush)
    }
}

/// Per-pair lock with cheap and expensive write modes
#[derive(Debug, Default)]
pub struct PairLock {
    state: Mutex<LockState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

impl PairLock {
    /// Create an unlocked lock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lock already held in the given write mode
    #[must_use]
    pub fn new_locked(mode: PairLockType) -> Self {
        assert!(mode.is_write(), "a lock can only be created write-locked");
        let lock = Self::default();
        lock.state.lock().writer = Some(mode);
        lock
    }

    /// Acquire the lock, blocking until it is compatible
    pub fn acquire(&self, mode: PairLockType) {
        let mut state = self.state.lock();
        if mode.is_write() {
            state.waiting_writers += 1;
            while state.writer_blocked(mode) {
                self.writers_cv.wait(&mut state);
            }
            state.waiting_writers -= 1;
            state.writer = Some(mode);
        } else {
            if state.reader_blocked() {
                state.waiting_readers += 1;
                while state.reader_blocked() {
                    self.readers_cv.wait(&mut state);
                }
                state.waiting_readers -= 1;
            }
            state.readers += 1;
        }
    }

    /// Acquire the lock only if that is possible without waiting
    pub fn try_acquire(&self, mode: PairLockType) -> bool {
        let mut state = self.state.lock();
        if mode.is_write() {
            if state.writer_blocked(mode) || state.waiting_writers > 0 {
                return false;
            }
            state.writer = Some(mode);
        } else {
            if state.reader_blocked() {
                return false;
            }
            state.readers += 1;
        }
        true
    }

    /// Release a hold of the given mode
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held in that mode.
    pub fn release(&self, mode: PairLockType) {
        let mut state = self.state.lock();
        if mode.is_write() {
            assert_eq!(state.writer, Some(mode), "release of a write lock that is not held");
            state.writer = None;
        } else {
            assert!(state.readers > 0, "release of a read lock that is not held");
            state.readers -= 1;
            if state.readers > 0 {
                return;
            }
        }
        self.wake(&state);
    }

    /// Turn a cheap write hold into an expensive one
    ///
    /// Waits for an in-flight clone write of the pair to finish.
    pub fn upgrade(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            state.writer,
            Some(PairLockType::WriteCheap),
            "upgrade requires a cheap write hold"
        );
        while state.clone_flush {
            self.writers_cv.wait(&mut state);
        }
        state.writer = Some(PairLockType::WriteExpensive);
    }

    /// Weaken a write hold to `WriteCheap` or `Read`
    pub fn downgrade(&self, to: PairLockType) {
        let mut state = self.state.lock();
        assert!(state.writer.is_some(), "downgrade requires a write hold");
        match to {
            PairLockType::WriteCheap => state.writer = Some(PairLockType::WriteCheap),
            PairLockType::Read => {
                state.writer = None;
                state.readers += 1;
                if state.waiting_writers == 0 && state.waiting_readers > 0 {
                    self.readers_cv.notify_all();
                }
            }
            PairLockType::WriteExpensive => {
                assert_eq!(
                    state.writer,
                    Some(PairLockType::WriteExpensive),
                    "use upgrade to strengthen a cheap write hold"
                );
            }
        }
    }

    /// Mark a clone write of this pair as in flight
    ///
    /// The caller holds the lock in a write mode.
    pub fn begin_clone_flush(&self) {
        let mut state = self.state.lock();
        assert!(state.writer.is_some(), "clone flush starts under a write hold");
        assert!(!state.clone_flush, "clone flush already in flight");
        state.clone_flush = true;
    }

    /// Mark the clone write as done and wake expensive writers
    pub fn end_clone_flush(&self) {
        let mut state = self.state.lock();
        assert!(state.clone_flush, "no clone flush in flight");
        state.clone_flush = false;
        self.writers_cv.notify_all();
    }

    /// Check whether a clone write is in flight
    pub fn clone_flush_in_flight(&self) -> bool {
        self.state.lock().clone_flush
    }

    /// Check whether anyone holds the lock
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.readers > 0 || state.writer.is_some()
    }

    /// Holders plus waiters
    pub fn users(&self) -> u32 {
        let state = self.state.lock();
        state.readers
            + u32::from(state.writer.is_some())
            + state.waiting_readers
            + state.waiting_writers
    }

    /// Threads blocked waiting to write
    pub fn waiting_writers(&self) -> u32 {
        self.state.lock().waiting_writers
    }

    fn wake(&self, state: &LockState) {
        if state.waiting_writers > 0 {
            self.writers_cv.notify_all();
        } else if state.waiting_readers > 0 {
            self.readers_cv.notify_all();
        }
    }
}
