//! Cachetable - Shared block cache for a tree-structured storage engine
//!
//! This crate implements the page cache that sits between tree nodes and
//! the files they live in:
//! - Pinning blocks with read, cheap-write and expensive-write locks
//! - Clock eviction with partial eviction and client throttling
//! - Checkpoints that write every dirty block exactly once
//! - Background cleaner, prefetch and partial fetch on worker pools

pub mod cachefile;
pub mod cachetable;
pub mod callbacks;
pub mod checkpointer;
mod cleaner;
mod evictor;
pub mod kibbutz;
pub mod pair;
pub mod pair_lock;
mod pair_table;
pub mod status;

// Re-exports
pub use cachefile::Cachefile;
pub use cachetable::{Cachetable, PinAttempt, PinnedPair};
pub use callbacks::{
    CacheValue, CleanerOutcome, Cloned, Fetched, FlushArgs, PairCallbacks, PartialEvictionCost,
    PartialEvictionEstimate,
};
pub use checkpointer::{CheckpointPhase, CheckpointStatus, Checkpointer};
pub use kibbutz::{Kibbutz, KibbutzStatus};
pub use pair::{PairInfo, PairKey, PairState};
pub use pair_lock::PairLock;
pub use status::{CachetableStats, CachetableStatus};

pub use cachetable_common::*;
