//! Configuration types for the cachetable
//!
//! Sizes are in the same units the callbacks report through `PairAttr`
//! (normally bytes). Eviction thresholds are percentages of `size_limit`.

use crate::error::{CachetableError, Result};
use serde::{Deserialize, Serialize};

/// Root configuration for a cachetable
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CachetableConfig {
    /// Target upper bound for the sum of all cached pair sizes
    pub size_limit: u64,
    /// Number of independently locked hash buckets (power of two)
    pub bucket_count: usize,
    /// Eviction thread configuration
    pub evictor: EvictorConfig,
    /// Background worker pools
    pub kibbutz: KibbutzConfig,
    /// Cleaner thread configuration
    pub cleaner: CleanerConfig,
    /// Checkpoint bookkeeping
    pub checkpoint: CheckpointConfig,
}

impl Default for CachetableConfig {
    fn default() -> Self {
        Self {
            size_limit: 128 * 1024 * 1024, // 128 MB
            bucket_count: 64,
            evictor: EvictorConfig::default(),
            kibbutz: KibbutzConfig::default(),
            cleaner: CleanerConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl CachetableConfig {
    /// Default configuration with the given size limit
    #[must_use]
    pub fn with_size_limit(size_limit: u64) -> Self {
        Self {
            size_limit,
            ..Default::default()
        }
    }

    /// Configuration for deterministic tests: the evictor only runs when
    /// signalled and the cleaner never runs on its own
    #[must_use]
    pub fn for_testing(size_limit: u64) -> Self {
        Self {
            size_limit,
            evictor: EvictorConfig {
                enabled: false,
                ..Default::default()
            },
            cleaner: CleanerConfig {
                period_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.size_limit == 0 {
            return Err(CachetableError::configuration("size_limit must be non-zero"));
        }
        if self.bucket_count == 0 || !self.bucket_count.is_power_of_two() {
            return Err(CachetableError::configuration(format!(
                "bucket_count must be a non-zero power of two, got {}",
                self.bucket_count
            )));
        }
        self.evictor.validate()?;
        self.kibbutz.validate()?;
        if self.cleaner.period_ms > 0 && self.cleaner.iterations == 0 {
            return Err(CachetableError::configuration(
                "cleaner iterations must be non-zero when the cleaner is enabled",
            ));
        }
        Ok(())
    }
}

/// Eviction thread configuration
///
/// The low watermark is the size limit itself: a pass stops once the
/// unreserved size drops to it. Clients wake the evictor above the low
/// hysteresis, block above the high watermark, and are released again
/// below the high hysteresis.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictorConfig {
    /// Run on a timer and on client pressure; when false, only on explicit signal
    pub enabled: bool,
    /// Timer period between passes (milliseconds)
    pub period_ms: u64,
    /// Size at which clients wake the evictor (percent of limit)
    pub low_hysteresis_pct: u32,
    /// Size below which blocked clients are released (percent of limit)
    pub high_hysteresis_pct: u32,
    /// Size above which inserting clients block (percent of limit)
    pub high_watermark_pct: u32,
}

impl Default for EvictorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 1000,
            low_hysteresis_pct: 110,
            high_hysteresis_pct: 125,
            high_watermark_pct: 150,
        }
    }
}

impl EvictorConfig {
    fn validate(&self) -> Result<()> {
        let ordered = 100 <= self.low_hysteresis_pct
            && self.low_hysteresis_pct <= self.high_hysteresis_pct
            && self.high_hysteresis_pct <= self.high_watermark_pct;
        if !ordered {
            return Err(CachetableError::configuration(format!(
                "evictor percentages must be ordered, 100 <= {} <= {} <= {}",
                self.low_hysteresis_pct, self.high_hysteresis_pct, self.high_watermark_pct
            )));
        }
        if self.enabled && self.period_ms == 0 {
            return Err(CachetableError::configuration(
                "evictor period_ms must be non-zero when enabled",
            ));
        }
        Ok(())
    }
}

/// Background worker pool sizes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KibbutzConfig {
    /// Workers for client jobs (prefetch, background fetch)
    pub client_threads: usize,
    /// Workers for eviction writes
    pub cachetable_threads: usize,
    /// Workers for checkpoint clone writes
    pub checkpoint_threads: usize,
    /// Maximum queued jobs per pool before enqueuers wait
    pub queue_depth: usize,
}

impl Default for KibbutzConfig {
    fn default() -> Self {
        Self {
            client_threads: 2,
            cachetable_threads: 2,
            checkpoint_threads: 2,
            queue_depth: 1024,
        }
    }
}

impl KibbutzConfig {
    fn validate(&self) -> Result<()> {
        if self.client_threads == 0 || self.cachetable_threads == 0 || self.checkpoint_threads == 0
        {
            return Err(CachetableError::configuration(
                "every kibbutz needs at least one worker",
            ));
        }
        if self.queue_depth == 0 {
            return Err(CachetableError::configuration("queue_depth must be non-zero"));
        }
        Ok(())
    }
}

/// Cleaner thread configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Period between cleaner runs (milliseconds, 0 = disabled)
    pub period_ms: u64,
    /// Pairs cleaned per run
    pub iterations: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            iterations: 5,
        }
    }
}

/// Checkpoint bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// A begin or end phase longer than this is counted as long (milliseconds)
    pub long_phase_ms: u64,
    /// Period of the checkpoint thread once it is started
    /// (milliseconds, 0 = checkpoints are only taken on request)
    pub period_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            long_phase_ms: 1000,
            period_ms: 60_000,
        }
    }
}
