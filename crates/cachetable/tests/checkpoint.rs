//! Checkpoint protocol

mod common;

use cachetable::{
    CacheDirty, CachetableConfig, CachetableError, CheckpointPhase, Lsn, PairAttr, PairLockType,
};
use common::{Block, Event, Fixture, Recorder, block};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

fn put_dirty(fx: &Fixture, n: i64) {
    let pinned = fx
        .ct
        .put(&fx.cf, block(n), Block::new(n, 0), PairAttr::new(1))
        .unwrap();
    pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());
}

fn checkpoint_writes(recorder: &Recorder, n: i64) -> usize {
    recorder
        .flushes_of(n)
        .iter()
        .filter(|args| args.for_checkpoint && args.write_me)
        .count()
}

#[test]
fn test_checkpoint_writes_dirty_pinned_pair_after_unpin() {
    let fx = Arc::new(Fixture::for_testing(100));
    put_dirty(&fx, 1);
    let clean = fx.ct.get_and_pin(&fx.cf, block(2), PairLockType::Read).unwrap();
    clean.unpin(CacheDirty::Clean, PairAttr::invalid());

    let dirty_pin = fx.ct.get_and_pin(&fx.cf, block(1), PairLockType::Read).unwrap();
    let clean_pin = fx.ct.get_and_pin(&fx.cf, block(2), PairLockType::Read).unwrap();

    fx.ct.begin_checkpoint(Lsn::new(10)).unwrap();
    let pending: Vec<i64> = fx
        .ct
        .pending_pairs()
        .iter()
        .map(|info| info.key.blocknum.get())
        .collect();
    assert_eq!(pending, vec![1]);

    let ender = {
        let fx = Arc::clone(&fx);
        thread::spawn(move || fx.ct.end_checkpoint().unwrap())
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fx.ct.checkpointer().phase(), CheckpointPhase::Ending);
    assert_ne!(fx.ct.checkpointer().status().footprint, 0);
    assert_eq!(checkpoint_writes(&fx.recorder, 1), 0);

    dirty_pin.unpin(CacheDirty::Clean, PairAttr::invalid());
    clean_pin.unpin(CacheDirty::Clean, PairAttr::invalid());
    ender.join().unwrap();

    assert_eq!(checkpoint_writes(&fx.recorder, 1), 1);
    assert!(fx.recorder.flushes_of(2).is_empty());
    assert!(fx.ct.pending_pairs().is_empty());
    assert_eq!(fx.recorder.count(&Event::Checkpoint(Lsn::new(10))), 1);
    assert_eq!(fx.recorder.count(&Event::EndCheckpoint(Lsn::new(10))), 1);

    let checkpointer = fx.ct.checkpointer();
    assert_eq!(checkpointer.phase(), CheckpointPhase::Idle);
    assert_eq!(checkpointer.last_lsn(), Lsn::new(10));
    let status = checkpointer.status();
    assert_eq!(status.checkpoints_taken, 1);
    assert_eq!(status.pairs_written, 1);
    assert_eq!(status.footprint, 0);

    let info = fx.ct.pairs_in_layout_order();
    assert_eq!(info[0].dirty, CacheDirty::Clean);
    fx.ct.verify();
}

#[test]
fn test_pending_pair_written_once_when_pinned_for_write() {
    let fx = Fixture::for_testing(100);
    put_dirty(&fx, 1);
    fx.ct.begin_checkpoint(Lsn::new(5)).unwrap();

    let mut pinned = fx
        .ct
        .get_and_pin(&fx.cf, block(1), PairLockType::WriteCheap)
        .unwrap();
    assert_eq!(checkpoint_writes(&fx.recorder, 1), 1);
    pinned.value_mut().data = 99;
    pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());

    fx.ct.end_checkpoint().unwrap();
    assert_eq!(checkpoint_writes(&fx.recorder, 1), 1);

    let info = &fx.ct.pairs_in_layout_order()[0];
    assert_eq!(info.dirty, CacheDirty::Dirty);
    assert!(!info.checkpoint_pending);
    fx.ct.verify();
}

#[test]
fn test_clone_write_keeps_redirtied_pair_dirty() {
    let mut recorder = Recorder::new();
    recorder.cloneable = true;
    recorder.clone_flush_delay = Some(Duration::from_millis(20));
    let fx = Fixture::new(CachetableConfig::for_testing(100), recorder);
    put_dirty(&fx, 1);
    fx.ct.begin_checkpoint(Lsn::new(7)).unwrap();

    let mut pinned = fx
        .ct
        .get_and_pin(&fx.cf, block(1), PairLockType::WriteCheap)
        .unwrap();
    assert_eq!(fx.recorder.count(&Event::Clone(1)), 1);
    pinned.value_mut().data = 42;
    pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());

    fx.ct.end_checkpoint().unwrap();
    let flushes = fx.recorder.flushes_of(1);
    assert_eq!(flushes.len(), 1);
    assert!(flushes[0].is_clone);
    assert!(flushes[0].for_checkpoint);

    let info = &fx.ct.pairs_in_layout_order()[0];
    assert_eq!(info.dirty, CacheDirty::Dirty);
    assert!(!info.clone_in_flight);
    assert_eq!(fx.ct.status().size_cloned, 0);
    assert_eq!(fx.ct.checkpointer().status().clone_writes, 1);
    fx.ct.verify();
}

#[test]
fn test_partial_fetch_waits_for_clone_write() {
    let mut recorder = Recorder::new();
    recorder.cloneable = true;
    recorder.clone_flush_delay = Some(Duration::from_millis(100));
    let fx = Fixture::new(CachetableConfig::for_testing(100), recorder);
    put_dirty(&fx, 1);
    fx.ct.begin_checkpoint(Lsn::new(3)).unwrap();

    let mut pinned = fx
        .ct
        .get_and_pin(&fx.cf, block(1), PairLockType::WriteCheap)
        .unwrap();
    pinned.value_mut().partial = true;
    pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());

    let pinned = fx.ct.get_and_pin(&fx.cf, block(1), PairLockType::Read).unwrap();
    assert!(!pinned.value().partial);
    pinned.unpin(CacheDirty::Clean, PairAttr::invalid());

    let clone_written = fx
        .recorder
        .position(|e| matches!(e, Event::Flush { blocknum: 1, args } if args.is_clone))
        .unwrap();
    let partial_fetch = fx
        .recorder
        .position(|e| *e == Event::PartialFetch(1))
        .unwrap();
    assert!(clone_written < partial_fetch);

    fx.ct.end_checkpoint().unwrap();
    fx.ct.verify();
}

#[test]
fn test_begin_marks_pair_being_partially_fetched() {
    let fx = Arc::new(Fixture::for_testing(100));
    let mut partial = Block::new(1, 0);
    partial.partial = true;
    let pinned = fx.ct.put(&fx.cf, block(1), partial, PairAttr::new(1)).unwrap();
    pinned.unpin(CacheDirty::Dirty, PairAttr::invalid());
    let (started, release) = fx.recorder.gate_partial_fetch();

    let reader = {
        let fx = Arc::clone(&fx);
        thread::spawn(move || {
            let pinned = fx.ct.get_and_pin(&fx.cf, block(1), PairLockType::Read).unwrap();
            assert!(!pinned.value().partial);
            pinned.unpin(CacheDirty::Clean, PairAttr::invalid());
        })
    };
    started.recv().unwrap();

    fx.ct.begin_checkpoint(Lsn::new(1)).unwrap();
    let pending: Vec<i64> = fx
        .ct
        .pending_pairs()
        .iter()
        .map(|info| info.key.blocknum.get())
        .collect();
    assert_eq!(pending, vec![1]);

    release.send(()).unwrap();
    reader.join().unwrap();
    fx.ct.end_checkpoint().unwrap();

    assert_eq!(checkpoint_writes(&fx.recorder, 1), 1);
    let info = &fx.ct.pairs_in_layout_order()[0];
    assert_eq!(info.dirty, CacheDirty::Clean);
    assert!(!info.checkpoint_pending);
    assert_eq!(fx.ct.status().partial_fetches, 1);
    fx.ct.verify();
}

#[test]
fn test_nonblocking_write_pin_of_pending_pair_defers_write() {
    let fx = Fixture::for_testing(100);
    put_dirty(&fx, 1);
    fx.ct.begin_checkpoint(Lsn::new(4)).unwrap();

    let mut unlocks = 0;
    let attempt = fx
        .ct
        .get_and_pin_nonblocking(&fx.cf, block(1), PairLockType::WriteExpensive, || unlocks += 1)
        .unwrap();
    assert!(attempt.is_try_again());
    assert_eq!(unlocks, 1);

    // the background write clears the pending mark
    for _ in 0..200 {
        if fx.ct.pending_pairs().is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(fx.ct.pending_pairs().is_empty());
    assert_eq!(checkpoint_writes(&fx.recorder, 1), 1);

    let attempt = fx
        .ct
        .get_and_pin_nonblocking(&fx.cf, block(1), PairLockType::WriteExpensive, || {
            panic!("unlocker must not run")
        })
        .unwrap();
    attempt.pinned().unwrap().unpin(CacheDirty::Clean, PairAttr::invalid());
    fx.ct.end_checkpoint().unwrap();
    assert_eq!(checkpoint_writes(&fx.recorder, 1), 1);
}

#[test]
fn test_eviction_of_pending_pair_counts_as_checkpoint_write() {
    let fx = Fixture::for_testing(1);
    put_dirty(&fx, 1);
    put_dirty(&fx, 2);
    fx.ct.begin_checkpoint(Lsn::new(8)).unwrap();
    fx.ct.signal_eviction_thread_and_wait();
    fx.ct.end_checkpoint().unwrap();

    let total: usize = [1, 2].iter().map(|n| checkpoint_writes(&fx.recorder, *n)).sum();
    assert_eq!(total, 2);
    assert_eq!(fx.ct.checkpointer().status().pairs_written, 2);
    fx.ct.verify();
}

#[test]
fn test_checkpoint_phase_errors() {
    let fx = Fixture::for_testing(100);
    assert!(matches!(
        fx.ct.end_checkpoint(),
        Err(CachetableError::NoCheckpointInProgress)
    ));
    fx.ct.begin_checkpoint(Lsn::new(1)).unwrap();
    assert!(matches!(
        fx.ct.begin_checkpoint(Lsn::new(2)),
        Err(CachetableError::CheckpointInProgress)
    ));
    fx.ct.end_checkpoint().unwrap();
    assert_eq!(fx.recorder.count(&Event::BeginCheckpoint(Lsn::new(1))), 1);
    assert_eq!(fx.ct.checkpointer().last_lsn(), Lsn::new(1));
}

#[test]
fn test_periodic_checkpoints() {
    let mut config = CachetableConfig::for_testing(100);
    config.checkpoint.period_ms = 10;
    let fx = Fixture::new(config, Recorder::new());
    put_dirty(&fx, 1);

    let next_lsn = Arc::new(AtomicU64::new(100));
    let source = Arc::clone(&next_lsn);
    fx.ct
        .start_periodic_checkpoints(move || Lsn::new(source.fetch_add(1, Ordering::SeqCst)))
        .unwrap();
    assert!(matches!(
        fx.ct.start_periodic_checkpoints(|| Lsn::ZERO),
        Err(CachetableError::Configuration(_))
    ));

    for _ in 0..400 {
        if fx.ct.checkpointer().status().checkpoints_taken > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    fx.ct.close().unwrap();

    let status = fx.ct.checkpointer().status();
    assert!(status.checkpoints_taken > 0);
    assert_eq!(status.period_ms, 10);
    assert!(status.last_lsn >= Lsn::new(100));
    assert_eq!(checkpoint_writes(&fx.recorder, 1), 1);
}

#[test]
fn test_periodic_checkpoints_need_a_period() {
    let mut config = CachetableConfig::for_testing(100);
    config.checkpoint.period_ms = 0;
    let fx = Fixture::new(config, Recorder::new());
    assert!(matches!(
        fx.ct.start_periodic_checkpoints(|| Lsn::ZERO),
        Err(CachetableError::Configuration(_))
    ));
}
