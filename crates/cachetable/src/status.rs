//! Cachetable statistics

use crate::checkpointer::CheckpointStatus;
use crate::kibbutz::KibbutzStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A pressure wait longer than this is also counted as long
pub(crate) const LONG_PRESSURE_WAIT: Duration = Duration::from_secs(1);

pub(crate) fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Cachetable counters
#[derive(Debug, Default)]
pub struct CachetableStats {
    /// Pins satisfied from memory
    pub hits: AtomicU64,
    /// Pins that had to fetch
    pub misses: AtomicU64,
    /// Time spent fetching on a miss (microseconds)
    pub miss_time_us: AtomicU64,
    /// Prefetches that scheduled I/O
    pub prefetches: AtomicU64,
    /// Pairs fully evicted
    pub evictions: AtomicU64,
    /// Partial evictions executed
    pub partial_evictions: AtomicU64,
    /// Partial fetches executed
    pub partial_fetches: AtomicU64,
    /// Cleaner callback invocations
    pub cleaner_executions: AtomicU64,
    /// Clients that blocked on cache pressure
    pub wait_pressure_count: AtomicU64,
    /// Time clients spent blocked on cache pressure (microseconds)
    pub wait_pressure_time_us: AtomicU64,
    /// Pressure waits longer than one second
    pub long_wait_pressure_count: AtomicU64,
    /// Time spent in long pressure waits (microseconds)
    pub long_wait_pressure_time_us: AtomicU64,
}

impl CachetableStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.miss_time_us,
            &self.prefetches,
            &self.evictions,
            &self.partial_evictions,
            &self.partial_fetches,
            &self.cleaner_executions,
            &self.wait_pressure_count,
            &self.wait_pressure_time_us,
            &self.long_wait_pressure_count,
            &self.long_wait_pressure_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.miss_time_us.fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn record_pressure_wait(&self, elapsed: Duration) {
        let us = micros(elapsed);
        self.wait_pressure_count.fetch_add(1, Ordering::Relaxed);
        self.wait_pressure_time_us.fetch_add(us, Ordering::Relaxed);
        if elapsed >= LONG_PRESSURE_WAIT {
            self.long_wait_pressure_count.fetch_add(1, Ordering::Relaxed);
            self.long_wait_pressure_time_us.fetch_add(us, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of the whole cachetable
#[derive(Debug, Clone, Serialize)]
pub struct CachetableStatus {
    pub hits: u64,
    pub misses: u64,
    pub miss_time_us: u64,
    pub prefetches: u64,
    pub evictions: u64,
    pub partial_evictions: u64,
    pub partial_fetches: u64,
    pub cleaner_executions: u64,
    pub wait_pressure_count: u64,
    pub wait_pressure_time_us: u64,
    pub long_wait_pressure_count: u64,
    pub long_wait_pressure_time_us: u64,
    /// Sum of all resident pair sizes
    pub size_current: i64,
    /// Configured limit
    pub size_limit: i64,
    /// Bytes being released by in-flight evictions
    pub size_evicting: i64,
    /// Bytes held by checkpoint clones awaiting writeback
    pub size_cloned: i64,
    /// Resident bytes of interior nodes
    pub size_nonleaf: i64,
    /// Resident bytes of leaf nodes
    pub size_leaf: i64,
    /// Resident bytes of rollback nodes
    pub size_rollback: i64,
    /// Outstanding cleaner work over all pairs
    pub size_cachepressure: i64,
    /// Cleaner thread period, 0 when it only runs on demand
    pub cleaner_period_ms: u64,
    /// Pairs the cleaner visits per run
    pub cleaner_iterations: usize,
    /// Resident pairs
    pub pair_count: usize,
    pub client_pool: KibbutzStatus,
    pub cachetable_pool: KibbutzStatus,
    pub checkpoint_pool: KibbutzStatus,
    pub checkpoint: CheckpointStatus,
}

impl CachetableStatus {
    pub(crate) fn from_counters(stats: &CachetableStats) -> Self {
        Self {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            miss_time_us: stats.miss_time_us.load(Ordering::Relaxed),
            prefetches: stats.prefetches.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            partial_evictions: stats.partial_evictions.load(Ordering::Relaxed),
            partial_fetches: stats.partial_fetches.load(Ordering::Relaxed),
            cleaner_executions: stats.cleaner_executions.load(Ordering::Relaxed),
            wait_pressure_count: stats.wait_pressure_count.load(Ordering::Relaxed),
            wait_pressure_time_us: stats.wait_pressure_time_us.load(Ordering::Relaxed),
            long_wait_pressure_count: stats.long_wait_pressure_count.load(Ordering::Relaxed),
            long_wait_pressure_time_us: stats.long_wait_pressure_time_us.load(Ordering::Relaxed),
            size_current: 0,
            size_limit: 0,
            size_evicting: 0,
            size_cloned: 0,
            size_nonleaf: 0,
            size_leaf: 0,
            size_rollback: 0,
            size_cachepressure: 0,
            cleaner_period_ms: 0,
            cleaner_iterations: 0,
            pair_count: 0,
            client_pool: KibbutzStatus::default(),
            cachetable_pool: KibbutzStatus::default(),
            checkpoint_pool: KibbutzStatus::default(),
            checkpoint: CheckpointStatus::default(),
        }
    }
}
