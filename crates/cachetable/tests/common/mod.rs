//! Shared fixtures for cachetable integration tests

#![allow(dead_code)]

use cachetable::{
    BlockNum, CacheDirty, Cachefile, Cachetable, CachetableConfig, CachetableError, CleanerOutcome,
    Cloned, Fetched, FlushArgs, FullHash, Lsn, PairAttr, PairCallbacks, PartialEvictionEstimate,
    Result,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Block contents used by the tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub blocknum: i64,
    pub data: u64,
    /// Part of the block is not resident
    pub partial: bool,
}

impl Block {
    pub fn new(blocknum: i64, data: u64) -> Self {
        Self {
            blocknum,
            data,
            partial: false,
        }
    }
}

/// One callback invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Fetch(i64),
    Flush { blocknum: i64, args: FlushArgs },
    PartialEvict(i64),
    PartialFetch(i64),
    Clone(i64),
    Cleaner(i64),
    BeginCheckpoint(Lsn),
    Checkpoint(Lsn),
    EndCheckpoint(Lsn),
    Close,
}

/// Partial eviction behaviour: when a pair has `trigger_size`, report
/// `estimate` and shrink it to `shrunk_size`
#[derive(Debug, Clone, Copy)]
pub struct PartialEvictionRule {
    pub trigger_size: i64,
    pub estimate: PartialEvictionEstimate,
    pub shrunk_size: i64,
}

/// Callbacks that record every invocation
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    sizes: Mutex<HashMap<i64, i64>>,
    pressure: Mutex<HashMap<i64, i64>>,
    failing: Mutex<HashSet<i64>>,
    fetch_partial: Mutex<HashSet<i64>>,
    partial_fetch_gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    pub fetch_delay: Option<Duration>,
    pub clone_flush_delay: Option<Duration>,
    pub cloneable: bool,
    pub partial_eviction: Option<PartialEvictionRule>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Footprint reported when `blocknum` is fetched (default 1)
    pub fn set_size(&self, blocknum: i64, size: i64) {
        self.sizes.lock().insert(blocknum, size);
    }

    /// Cache pressure reported when `blocknum` is fetched
    pub fn set_pressure(&self, blocknum: i64, pressure: i64) {
        self.pressure.lock().insert(blocknum, pressure);
    }

    /// Make fetches of `blocknum` fail
    pub fn fail_fetch(&self, blocknum: i64) {
        self.failing.lock().insert(blocknum);
    }

    /// Make `blocknum` arrive partially resident
    pub fn fetch_partially(&self, blocknum: i64) {
        self.fetch_partial.lock().insert(blocknum);
    }

    /// Hold the next partial fetch inside `pf_execute`
    ///
    /// The first receiver fires once that fetch has started; the fetch
    /// finishes after something is sent on the returned sender.
    pub fn gate_partial_fetch(&self) -> (Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        *self.partial_fetch_gate.lock() = Some((started_tx, release_rx));
        (started_rx, release_tx)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Flushes of one block
    pub fn flushes_of(&self, blocknum: i64) -> Vec<FlushArgs> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Flush { blocknum: b, args } if *b == blocknum => Some(*args),
                _ => None,
            })
            .collect()
    }

    /// Blocks flushed out of the cache, in order
    pub fn evicted(&self) -> Vec<i64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Flush { blocknum, args } if !args.keep_me => Some(*blocknum),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == wanted).count()
    }

    pub fn count_matching(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.lock().iter().position(pred)
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn attr_for(&self, blocknum: i64) -> PairAttr {
        let size = self.sizes.lock().get(&blocknum).copied().unwrap_or(1);
        let pressure = self.pressure.lock().get(&blocknum).copied().unwrap_or(0);
        PairAttr::new(size).with_cache_pressure(pressure)
    }
}

impl PairCallbacks<Block> for Recorder {
    fn fetch(
        &self,
        _file: &File,
        blocknum: BlockNum,
        _fullhash: FullHash,
    ) -> Result<Fetched<Block>> {
        if let Some(delay) = self.fetch_delay {
            thread::sleep(delay);
        }
        let b = blocknum.get();
        self.record(Event::Fetch(b));
        if self.failing.lock().contains(&b) {
            return Err(CachetableError::fetch(
                cachetable::FileNum::new(0),
                blocknum,
                "injected failure",
            ));
        }
        let mut block = Block::new(b, 0);
        block.partial = self.fetch_partial.lock().contains(&b);
        Ok(Fetched::clean(block, self.attr_for(b)))
    }

    fn flush(
        &self,
        _file: &File,
        blocknum: BlockNum,
        _value: &Block,
        attr: PairAttr,
        args: FlushArgs,
    ) -> Result<PairAttr> {
        if args.is_clone {
            if let Some(delay) = self.clone_flush_delay {
                thread::sleep(delay);
            }
        }
        self.record(Event::Flush {
            blocknum: blocknum.get(),
            args,
        });
        Ok(attr)
    }

    fn pe_estimate(&self, _value: &Block, attr: PairAttr) -> PartialEvictionEstimate {
        match self.partial_eviction {
            Some(rule) if rule.trigger_size == attr.size => rule.estimate,
            _ => PartialEvictionEstimate::none(),
        }
    }

    fn pe_execute(&self, value: &mut Block, attr: PairAttr) -> PairAttr {
        self.record(Event::PartialEvict(value.blocknum));
        match self.partial_eviction {
            Some(rule) => PairAttr::new(rule.shrunk_size),
            None => attr,
        }
    }

    fn pf_req(&self, value: &Block) -> bool {
        value.partial
    }

    fn pf_execute(&self, _file: &File, blocknum: BlockNum, value: &mut Block) -> Result<PairAttr> {
        let gate = self.partial_fetch_gate.lock().take();
        if let Some((started, release)) = gate {
            started.send(()).unwrap();
            release.recv().unwrap();
        }
        self.record(Event::PartialFetch(blocknum.get()));
        value.partial = false;
        Ok(self.attr_for(blocknum.get()))
    }

    fn clone_value(&self, value: &Block) -> Option<Cloned<Block>> {
        if !self.cloneable {
            return None;
        }
        self.record(Event::Clone(value.blocknum));
        Some(Cloned {
            value: value.clone(),
            size: 1,
        })
    }

    fn cleaner(
        &self,
        blocknum: BlockNum,
        value: &mut Block,
        _attr: PairAttr,
    ) -> Result<CleanerOutcome> {
        self.record(Event::Cleaner(blocknum.get()));
        value.data += 1;
        Ok(CleanerOutcome {
            dirty: CacheDirty::Dirty,
            attr: PairAttr::new(1),
        })
    }

    fn begin_checkpoint(&self, lsn: Lsn) {
        self.record(Event::BeginCheckpoint(lsn));
    }

    fn checkpoint(&self, _file: &File, lsn: Lsn) -> Result<()> {
        self.record(Event::Checkpoint(lsn));
        Ok(())
    }

    fn end_checkpoint(&self, lsn: Lsn) {
        self.record(Event::EndCheckpoint(lsn));
    }

    fn on_close(&self, _file: &File) -> Result<()> {
        self.record(Event::Close);
        Ok(())
    }
}

/// A cachetable with one open cachefile
pub struct Fixture {
    pub dir: TempDir,
    pub ct: Cachetable<Block>,
    pub cf: Cachefile<Block>,
    pub recorder: Arc<Recorder>,
}

impl Fixture {
    pub fn new(config: CachetableConfig, recorder: Recorder) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let ct = Cachetable::new(config).unwrap();
        let recorder = Arc::new(recorder);
        let cf = ct
            .open_cachefile(dir.path().join("blocks"), recorder.clone())
            .unwrap();
        Self {
            dir,
            ct,
            cf,
            recorder,
        }
    }

    /// Manual eviction, no cleaner thread
    pub fn for_testing(limit: u64) -> Self {
        Self::new(CachetableConfig::for_testing(limit), Recorder::new())
    }
}

pub fn block(n: i64) -> BlockNum {
    BlockNum::new(n)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
