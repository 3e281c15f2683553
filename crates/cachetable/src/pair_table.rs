//! Pair table: hash buckets, clock ring and pending set
//!
//! Lookups go through a fixed array of independently locked hash buckets.
//! Every pair is also threaded on a circular list, the clock ring, that the
//! evictor sweeps with its clock hand and the cleaner samples with its own
//! hand. Pairs marked for the checkpoint in progress are additionally kept
//! in the pending set.
//!
//! Lock order: `pending_lock` → `lists` → bucket mutex → pair metadata.
//! The pair lock's internal mutex is a leaf and may be taken under any of
//! them.

use crate::callbacks::CacheValue;
use crate::pair::{Pair, PairKey, PairState};
use cachetable_common::{FileNum, FullHash, PairAttr};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct RingNode<V> {
    pair: Arc<Pair<V>>,
    prev: usize,
    next: usize,
}

/// Circular doubly-linked list over a slot arena
///
/// New pairs are linked in just behind the clock hand, so they are the
/// last ones the hand reaches.
pub(crate) struct ClockRing<V> {
    nodes: Vec<Option<RingNode<V>>>,
    free: Vec<usize>,
    hand: Option<usize>,
    cleaner_hand: Option<usize>,
    len: usize,
}

impl<V: CacheValue> ClockRing<V> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            hand: None,
            cleaner_hand: None,
            len: 0,
        }
    }

    /// Pick the slot the next inserted pair will occupy
    fn reserve_slot(&mut self) -> usize {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        self.nodes.push(None);
        self.nodes.len() - 1
    }

    fn node(&self, slot: usize) -> &RingNode<V> {
        self.nodes[slot].as_ref().expect("clock ring slot is empty")
    }

    fn node_mut(&mut self, slot: usize) -> &mut RingNode<V> {
        self.nodes[slot].as_mut().expect("clock ring slot is empty")
    }

    fn insert(&mut self, slot: usize, pair: Arc<Pair<V>>) {
        debug_assert!(self.nodes[slot].is_none());
        match self.hand {
            None => {
                self.nodes[slot] = Some(RingNode {
                    pair,
                    prev: slot,
                    next: slot,
                });
                self.hand = Some(slot);
                self.cleaner_hand = Some(slot);
            }
            Some(hand) => {
                let prev = self.node(hand).prev;
                self.nodes[slot] = Some(RingNode {
                    pair,
                    prev,
                    next: hand,
                });
                self.node_mut(prev).next = slot;
                self.node_mut(hand).prev = slot;
            }
        }
        self.len += 1;
    }

    fn remove(&mut self, slot: usize) -> Arc<Pair<V>> {
        let node = self.nodes[slot].take().expect("clock ring slot is empty");
        if self.len == 1 {
            self.hand = None;
            self.cleaner_hand = None;
        } else {
            self.node_mut(node.prev).next = node.next;
            self.node_mut(node.next).prev = node.prev;
            if self.hand == Some(slot) {
                self.hand = Some(node.next);
            }
            if self.cleaner_hand == Some(slot) {
                self.cleaner_hand = Some(node.next);
            }
        }
        self.len -= 1;
        self.free.push(slot);
        node.pair
    }

    fn get(&self, slot: usize) -> Option<&Arc<Pair<V>>> {
        self.nodes.get(slot)?.as_ref().map(|node| &node.pair)
    }

    /// Return the pair under the clock hand and move the hand past it
    fn advance(&mut self) -> Option<Arc<Pair<V>>> {
        let hand = self.hand?;
        let node = self.node(hand);
        let pair = Arc::clone(&node.pair);
        self.hand = Some(node.next);
        Some(pair)
    }

    /// Up to `count` pairs starting at the cleaner hand; the hand moves past them
    fn advance_cleaner(&mut self, count: usize) -> Vec<Arc<Pair<V>>> {
        let mut out = Vec::new();
        let Some(mut slot) = self.cleaner_hand else {
            return out;
        };
        for _ in 0..count.min(self.len) {
            let node = self.node(slot);
            out.push(Arc::clone(&node.pair));
            slot = node.next;
        }
        self.cleaner_hand = Some(slot);
        out
    }

    /// Pairs in the order the clock hand will visit them
    fn iter_from_hand(&self) -> impl Iterator<Item = &Arc<Pair<V>>> {
        let mut slot = self.hand;
        (0..self.len).filter_map(move |_| {
            let node = self.node(slot?);
            slot = Some(node.next);
            Some(&node.pair)
        })
    }

    fn verify_links(&self) {
        let Some(start) = self.hand else {
            assert_eq!(self.len, 0, "empty clock ring with nonzero length");
            assert!(self.cleaner_hand.is_none(), "cleaner hand on empty ring");
            return;
        };
        let mut seen = HashSet::new();
        let mut slot = start;
        for _ in 0..self.len {
            let node = self.node(slot);
            assert_eq!(self.node(node.next).prev, slot, "broken clock ring link");
            assert_eq!(node.pair.slot(), slot, "pair recorded in the wrong ring slot");
            assert!(seen.insert(slot), "clock ring revisits a slot");
            slot = node.next;
        }
        assert_eq!(slot, start, "clock ring does not close");
        let cleaner = self.cleaner_hand.expect("cleaner hand missing");
        assert!(seen.contains(&cleaner), "cleaner hand off the ring");
    }
}

/// Structures guarded by the list lock
pub(crate) struct PairLists<V> {
    clock: ClockRing<V>,
    pending: BTreeMap<usize, Arc<Pair<V>>>,
}

type Bucket<V> = Mutex<HashMap<PairKey, Arc<Pair<V>>>>;

/// All cached pairs
pub(crate) struct PairTable<V> {
    buckets: Box<[Bucket<V>]>,
    mask: u32,
    lists: RwLock<PairLists<V>>,
    /// Held for writing while a checkpoint marks pairs pending, for reading
    /// by anyone who inspects or clears a pending flag
    pub(crate) pending_lock: RwLock<()>,
    len: AtomicUsize,
}

impl<V: CacheValue> PairTable<V> {
    pub(crate) fn new(bucket_count: usize) -> Self {
        assert!(bucket_count.is_power_of_two(), "bucket count must be a power of two");
        let buckets = (0..bucket_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: u32::try_from(bucket_count - 1).unwrap_or(u32::MAX),
            lists: RwLock::new(PairLists {
                clock: ClockRing::new(),
                pending: BTreeMap::new(),
            }),
            pending_lock: RwLock::new(()),
            len: AtomicUsize::new(0),
        }
    }

    fn bucket(&self, fullhash: FullHash) -> &Bucket<V> {
        &self.buckets[(fullhash & self.mask) as usize]
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn find(&self, key: &PairKey, fullhash: FullHash) -> Option<Arc<Pair<V>>> {
        self.bucket(fullhash).lock().get(key).cloned()
    }

    /// Return the pair for `key`, creating it with `make` if absent
    ///
    /// `make` receives the ring slot of the new pair. The boolean is true
    /// when the pair was created by this call.
    pub(crate) fn find_or_insert(
        &self,
        key: PairKey,
        fullhash: FullHash,
        make: impl FnOnce(usize) -> Pair<V>,
    ) -> (Arc<Pair<V>>, bool) {
        if let Some(pair) = self.find(&key, fullhash) {
            return (pair, false);
        }
        let mut lists = self.lists.write();
        let mut bucket = self.bucket(fullhash).lock();
        if let Some(pair) = bucket.get(&key) {
            return (Arc::clone(pair), false);
        }
        let slot = lists.clock.reserve_slot();
        let pair = Arc::new(make(slot));
        debug_assert_eq!(pair.slot(), slot);
        lists.clock.insert(slot, Arc::clone(&pair));
        bucket.insert(key, Arc::clone(&pair));
        self.len.fetch_add(1, Ordering::AcqRel);
        (pair, true)
    }

    /// Unlink a pair from every structure
    pub(crate) fn remove(&self, pair: &Arc<Pair<V>>) {
        let mut lists = self.lists.write();
        let mut bucket = self.bucket(pair.fullhash()).lock();
        match bucket.get(&pair.key()) {
            Some(found) if Arc::ptr_eq(found, pair) => {
                bucket.remove(&pair.key());
            }
            _ => panic!("removing {:?} which is not in the table", pair.key()),
        }
        drop(bucket);
        lists.clock.remove(pair.slot());
        if lists
            .pending
            .get(&pair.slot())
            .is_some_and(|p| Arc::ptr_eq(p, pair))
        {
            lists.pending.remove(&pair.slot());
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
    }

    /// Mark every dirty resident pair pending; the caller holds
    /// `pending_lock` for writing
    ///
    /// A pair in the middle of a partial fetch is resident and gets marked
    /// too. Whoever writes it next takes its lock, so the write waits for
    /// the fetch to finish.
    pub(crate) fn mark_dirty_pairs_pending(&self) -> usize {
        let mut lists = self.lists.write();
        let mut marked = 0;
        for bucket in &*self.buckets {
            let bucket = bucket.lock();
            for pair in bucket.values() {
                let mut meta = pair.meta();
                if meta.state.is_resident() && meta.dirty.is_dirty() {
                    meta.checkpoint_pending = true;
                    lists.pending.insert(pair.slot(), Arc::clone(pair));
                    marked += 1;
                }
            }
        }
        marked
    }

    /// Clear a pair's pending flag and drop it from the pending set
    pub(crate) fn clear_pending(&self, pair: &Arc<Pair<V>>) {
        let mut lists = self.lists.write();
        pair.meta().checkpoint_pending = false;
        if lists
            .pending
            .get(&pair.slot())
            .is_some_and(|p| Arc::ptr_eq(p, pair))
        {
            lists.pending.remove(&pair.slot());
        }
    }

    pub(crate) fn pending_snapshot(&self) -> Vec<Arc<Pair<V>>> {
        self.lists.read().pending.values().cloned().collect()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.lists.read().pending.len()
    }

    /// The pair under the clock hand; the hand moves one step
    pub(crate) fn advance_clock_hand(&self) -> Option<Arc<Pair<V>>> {
        self.lists.write().clock.advance()
    }

    /// Among the next `sample` pairs at the cleaner hand, the unlocked one
    /// with the largest nonzero cache pressure
    pub(crate) fn pick_cleaner_candidate(&self, sample: usize) -> Option<Arc<Pair<V>>> {
        let candidates = self.lists.write().clock.advance_cleaner(sample);
        candidates
            .into_iter()
            .filter(|pair| pair.lock.users() == 0)
            .filter_map(|pair| {
                let meta = pair.meta();
                let pressure = meta.attr.cache_pressure_size;
                let eligible = meta.state == PairState::Available && pressure > 0;
                drop(meta);
                eligible.then_some((pressure, pair))
            })
            .max_by_key(|(pressure, _)| *pressure)
            .map(|(_, pair)| pair)
    }

    pub(crate) fn for_each_in_eviction_order(&self, mut f: impl FnMut(&Arc<Pair<V>>)) {
        let lists = self.lists.read();
        for pair in lists.clock.iter_from_hand() {
            f(pair);
        }
    }

    pub(crate) fn for_each_pending(&self, mut f: impl FnMut(&Arc<Pair<V>>)) {
        let lists = self.lists.read();
        for pair in lists.pending.values() {
            f(pair);
        }
    }

    /// Visit every pair ordered by file and block number
    pub(crate) fn for_each_in_layout_order(&self, mut f: impl FnMut(&Arc<Pair<V>>)) {
        let mut pairs = self.collect(|_| true);
        pairs.sort_by_key(|pair| pair.key());
        for pair in &pairs {
            f(pair);
        }
    }

    /// Pairs of one cachefile ordered by block number
    pub(crate) fn pairs_of(&self, filenum: FileNum) -> Vec<Arc<Pair<V>>> {
        let mut pairs = self.collect(|key| key.filenum == filenum);
        pairs.sort_by_key(|pair| pair.key());
        pairs
    }

    fn collect(&self, filter: impl Fn(&PairKey) -> bool) -> Vec<Arc<Pair<V>>> {
        let mut out = Vec::new();
        for bucket in &*self.buckets {
            out.extend(
                bucket
                    .lock()
                    .iter()
                    .filter(|(key, _)| filter(key))
                    .map(|(_, pair)| Arc::clone(pair)),
            );
        }
        out
    }

    /// Check every structural invariant; panics on the first violation
    ///
    /// Returns the summed size classes of every pair.
    pub(crate) fn verify(&self, expected_size: i64) -> PairAttr {
        let lists = self.lists.read();
        let mut slots = HashMap::new();
        let mut total_size = 0;
        let mut classes = PairAttr::new(0);
        for (index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock();
            for (key, pair) in bucket.iter() {
                assert_eq!(*key, pair.key(), "bucket entry filed under the wrong key");
                assert_eq!(pair.fullhash(), key.fullhash(), "stale full hash for {key:?}");
                assert_eq!(
                    (pair.fullhash() & self.mask) as usize,
                    index,
                    "{key:?} in the wrong bucket"
                );
                assert!(slots.insert(*key, pair.slot()).is_none(), "{key:?} cached twice");
                let ring_pair = lists
                    .clock
                    .get(pair.slot())
                    .unwrap_or_else(|| panic!("{key:?} missing from the clock ring"));
                assert!(Arc::ptr_eq(ring_pair, pair), "{key:?} ring slot holds another pair");

                let meta = pair.meta();
                assert_ne!(meta.state, PairState::Removed, "removed {key:?} still reachable");
                if meta.checkpoint_pending {
                    assert!(
                        lists
                            .pending
                            .get(&pair.slot())
                            .is_some_and(|p| Arc::ptr_eq(p, pair)),
                        "pending {key:?} missing from the pending set"
                    );
                }
                total_size += meta.attr.size;
                classes.nonleaf_size += meta.attr.nonleaf_size;
                classes.leaf_size += meta.attr.leaf_size;
                classes.rollback_size += meta.attr.rollback_size;
                classes.cache_pressure_size += meta.attr.cache_pressure_size;
            }
        }

        assert_eq!(slots.len(), lists.clock.len, "table and clock ring disagree on count");
        assert_eq!(slots.len(), self.len(), "pair count drifted");
        lists.clock.verify_links();

        for (slot, pair) in &lists.pending {
            assert_eq!(pair.slot(), *slot, "pending set keyed by the wrong slot");
            assert_eq!(
                slots.get(&pair.key()),
                Some(slot),
                "pending {:?} is not in the table",
                pair.key()
            );
            assert!(pair.meta().checkpoint_pending, "{:?} in pending set without flag", pair.key());
        }

        assert_eq!(total_size, expected_size, "size accounting drifted");
        classes
    }
}
