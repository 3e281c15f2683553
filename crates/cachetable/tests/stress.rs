//! Random interleavings of every client operation

mod common;

use cachetable::{CacheDirty, CachetableConfig, CachetableError, Lsn, PairAttr, PairLockType};
use common::{Block, Fixture, Recorder, block};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const KEYS: i64 = 64;

fn random_mode(rng: &mut impl Rng) -> PairLockType {
    match rng.gen_range(0..3) {
        0 => PairLockType::Read,
        1 => PairLockType::WriteCheap,
        _ => PairLockType::WriteExpensive,
    }
}

fn client(fx: &Fixture, ops: usize) {
    let mut rng = rand::thread_rng();
    for _ in 0..ops {
        let n = rng.gen_range(0..KEYS);
        match rng.gen_range(0..10) {
            0..=3 => {
                let mode = random_mode(&mut rng);
                let mut pinned = fx.ct.get_and_pin(&fx.cf, block(n), mode).unwrap();
                if mode.is_write() && rng.gen_bool(0.5) {
                    pinned.value_mut().data += 1;
                    let size = rng.gen_range(1..4);
                    pinned.unpin(CacheDirty::Dirty, PairAttr::new(size));
                } else {
                    pinned.unpin(CacheDirty::Clean, PairAttr::invalid());
                }
            }
            4 | 5 => {
                let mode = random_mode(&mut rng);
                let attempt = fx
                    .ct
                    .get_and_pin_nonblocking(&fx.cf, block(n), mode, || {})
                    .unwrap();
                if let Some(pinned) = attempt.pinned() {
                    pinned.unpin(CacheDirty::Clean, PairAttr::invalid());
                }
            }
            6 => match fx.ct.put(&fx.cf, block(n), Block::new(n, 0), PairAttr::new(2)) {
                Ok(pinned) => pinned.unpin(CacheDirty::Dirty, PairAttr::invalid()),
                Err(CachetableError::KeyExists { .. }) => {}
                Err(e) => panic!("put failed: {e}"),
            },
            7 => {
                let pinned = fx
                    .ct
                    .get_and_pin(&fx.cf, block(n), PairLockType::WriteExpensive)
                    .unwrap();
                pinned.unpin_and_remove(|_, _| {});
            }
            8 => {
                fx.ct.prefetch(&fx.cf, block(n)).unwrap();
            }
            _ => {
                if let Some(pinned) = fx
                    .ct
                    .maybe_get_and_pin(&fx.cf, block(n), PairLockType::WriteCheap)
                    .unwrap()
                {
                    pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());
                }
            }
        }
    }
}

#[test]
fn test_random_interleavings_keep_invariants() {
    let mut recorder = Recorder::new();
    recorder.cloneable = true;
    for n in (0..KEYS).step_by(7) {
        recorder.set_pressure(n, n + 1);
    }
    let fx = Arc::new(Fixture::new(CachetableConfig::for_testing(40), recorder));
    let stop = Arc::new(AtomicBool::new(false));

    let checkpointer = {
        let fx = Arc::clone(&fx);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut lsn = 1;
            while !stop.load(Ordering::Acquire) {
                fx.ct.begin_checkpoint(Lsn::new(lsn)).unwrap();
                thread::sleep(Duration::from_millis(2));
                fx.ct.end_checkpoint().unwrap();
                lsn += 1;
            }
            lsn - 1
        })
    };
    // eviction and cleaning on demand, so the final checks see a quiet cache
    let housekeeper = {
        let fx = Arc::clone(&fx);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                fx.ct.signal_eviction_thread_and_wait();
                fx.ct.run_cleaner();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let clients: Vec<_> = (0..6)
        .map(|_| {
            let fx = Arc::clone(&fx);
            thread::spawn(move || client(&fx, 500))
        })
        .collect();
    for handle in clients {
        handle.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    let checkpoints = checkpointer.join().unwrap();
    housekeeper.join().unwrap();

    // blocking pins wait out background fetches
    for n in 0..KEYS {
        let pinned = fx.ct.get_and_pin(&fx.cf, block(n), PairLockType::Read).unwrap();
        pinned.unpin(CacheDirty::Clean, PairAttr::invalid());
    }
    fx.ct.signal_eviction_thread_and_wait();
    fx.ct.verify();
    assert!(fx.ct.size_current() <= 40);

    let status = fx.ct.status();
    assert_eq!(status.checkpoint.checkpoints_taken, checkpoints);
    assert_eq!(status.size_cloned, 0);
    assert_eq!(status.size_evicting, 0);
    assert!(fx.ct.pending_pairs().is_empty());

    fx.ct.close().unwrap();
    assert_eq!(fx.ct.pair_count(), 0);
}
