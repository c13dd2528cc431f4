#![forbid(unsafe_code)]
//! Shared identifiers, units, and tuning parameters for tenfs.
//!
//! Everything in the scheduler core is denominated in two units: 4 KiB
//! blocks for cache and bandwidth, and TSC-style cycles for CPU time.
//! The conversion helpers here are the single source of truth for moving
//! between blocks/MiB and cycles/weight/progress.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Block number on the backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNo(pub u64);

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode number used as the secondary grouping key for cache slots.
///
/// Zero means "not file data" (metadata blocks); it is never a valid inode
/// and never enters the index maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNo(pub u32);

impl InodeNo {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application (client) identifier; one tenant exists per (worker, app).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(pub u32);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Worker thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl WorkerId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Identifier of an in-flight device request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockReqId(pub u64);

impl fmt::Display for BlockReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Block size in bytes. Cache and bandwidth are accounted in these units.
pub const BLOCK_SIZE: usize = 4096;

/// Tuning parameters, unit conversions, and derived constants.
///
/// The reference clock is the TSC frequency, which is stable and may differ
/// from the advertised CPU frequency (`lscpu | grep 'Model name'`).
pub mod params {
    /// Reference cycle frequency (2.1 GHz TSC).
    pub const CYCLES_PER_SECOND: u64 = 2_100 * 1_000_000;

    /// Tenant progress counters reset every 0.1 s of cycle time.
    pub const CYCLES_PER_CPU_EPOCH: u64 = CYCLES_PER_SECOND / 10;

    /// CPU shares are expressed as weights; no CPU runs beyond 8 GHz, so
    /// `cycles >> 20` always fits.
    pub const MAX_WEIGHT: u32 = 8192;

    /// Even a tenant with no allocated CPU is visited occasionally so that
    /// control-plane operations still land.
    pub const MIN_WEIGHT: u32 = 1;

    /// Cycles a worker can actually spend on requests per second; queueing
    /// overhead is excluded.
    pub const WORKER_AVAIL_WEIGHT: u32 = cycles_to_weight(1_900 * 1_000_000);
    pub const WORKER_AVAIL_CYCLES_PER_SECOND: u64 = weight_to_cycles(WORKER_AVAIL_WEIGHT);

    /// Leftover weight below this is vulnerable to hotness skew; the
    /// avoid-tiny partition policy splits a dedicated worker to grow it.
    pub const SOFT_MIN_WEIGHT: u32 = WORKER_AVAIL_WEIGHT / 5;

    /// Harvest granularity: one deal moves this much cache (32 MiB).
    pub const CACHE_DELTA: u32 = mb_to_blocks(32);

    /// No trading below this much cache per app.
    pub const MIN_CACHE_TOTAL: u32 = CACHE_DELTA;

    /// Floor so a tenant the allocator believes is full-hit can still make
    /// progress when its workload shifts (~1 MiB/s, per worker).
    pub const MIN_BANDWIDTH: i64 = 256;

    /// Same floor for cache (0.5 MiB, per worker).
    pub const MIN_CACHE: u32 = 128;

    /// Deals harvesting less than ~0.8 MiB/s are rejected, which keeps the
    /// trading loop convergent on stable workloads.
    pub const MIN_BANDWIDTH_HARVEST: i64 = 200;

    /// Requests processed per tenant per loop iteration; balances request
    /// work against device submission/polling.
    pub const NUM_REQS_PER_LOOP: usize = 3;

    /// Hit rates above this count as full-hit (absorbs float rounding).
    pub const FULL_HIT_THRESHOLD: f64 = 0.999;

    /// Rate-limiter frame length (~0.12 s at 2.1 GHz).
    pub const CYCLES_PER_FRAME: u64 = 1024 * 1024 * 256;

    /// Foreground flushes allowed in flight at once.
    pub const FG_FLUSH_LIMIT: usize = 10;

    #[must_use]
    pub const fn cycles_to_weight(cycles: u64) -> u32 {
        (cycles >> 20) as u32
    }

    #[must_use]
    pub const fn weight_to_cycles(weight: u32) -> u64 {
        (weight as u64) << 20
    }

    /// Virtual progress grows inversely with weight: a max-weight tenant
    /// ages 1:1, lighter tenants age faster.
    #[must_use]
    pub const fn cycles_to_progress(cycles: u64, weight: u32) -> u64 {
        cycles * MAX_WEIGHT as u64 / weight as u64
    }

    #[must_use]
    pub const fn progress_to_cycles(progress: u64, weight: u32) -> u64 {
        progress * weight as u64 / MAX_WEIGHT as u64
    }

    #[must_use]
    pub fn cycles_to_seconds(cycles: u64) -> f64 {
        cycles as f64 / CYCLES_PER_SECOND as f64
    }

    #[must_use]
    pub fn blocks_to_mb(blocks: u64) -> f64 {
        blocks as f64 / 256.0
    }

    #[must_use]
    pub const fn blocks_to_mb_int(blocks: u64) -> u64 {
        blocks / 256
    }

    #[must_use]
    pub const fn mb_to_blocks(mb: u32) -> u32 {
        mb * 256
    }

    /// Ghost-cache sweep geometry (coarse profile: 32 MiB..=1 GiB step 32 MiB).
    pub mod ghost {
        use super::mb_to_blocks;

        pub const MIN_SIZE: u32 = mb_to_blocks(32);
        pub const MAX_SIZE: u32 = mb_to_blocks(1024);
        pub const TICK: u32 = mb_to_blocks(32);
        pub const NUM_TICKS: usize = ((MAX_SIZE - MIN_SIZE) / TICK + 1) as usize;
    }
}

/// Allocator timing. A struct rather than constants so tests can shrink the
/// windows to milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocTiming {
    /// Wait after all apps first make progress, letting caches populate.
    pub preheat_window_us: u64,
    /// Full allocation period.
    pub freq_us: u64,
    /// Statistics collection window inside each period.
    pub stat_coll_window_us: u64,
    /// Post-allocation window with rate limiters off (0 = disabled).
    pub unlimited_bandwidth_window_us: u64,
    /// Trading rounds per harvest pass.
    pub max_trade_round: u32,
}

impl Default for AllocTiming {
    fn default() -> Self {
        Self {
            preheat_window_us: 10_000_000,
            freq_us: 30_000_000,
            stat_coll_window_us: 5_000_000,
            unlimited_bandwidth_window_us: 0,
            max_trade_round: u32::MAX,
        }
    }
}

impl AllocTiming {
    /// Quiet time between the end of one pass and the next stat window.
    #[must_use]
    pub fn stabilize_window_us(&self) -> u64 {
        self.freq_us
            .saturating_sub(self.stat_coll_window_us)
            .saturating_sub(self.unlimited_bandwidth_window_us)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.freq_us < self.stat_coll_window_us + self.unlimited_bandwidth_window_us {
            return Err(PolicyError::AllocTooFrequent {
                freq_us: self.freq_us,
            });
        }
        Ok(())
    }
}

/// Scheduling policy switches. Threaded explicitly through the server; there
/// is no global policy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Red button: with this off the allocator only collects statistics.
    pub alloc_enabled: bool,
    /// Cache-for-bandwidth trading; off means cache-unaware DRF.
    pub harvest_enabled: bool,
    /// Spread each app's resources and files evenly across workers.
    pub symm_partition: bool,
    /// Under asymmetric partition, avoid tiny leftover weights.
    pub avoid_tiny_weight: bool,
    /// Throttle a tenant that has used more than its CPU share within an
    /// epoch instead of staying work-conserving.
    pub strict_cpu_usage: bool,
    /// Partition the cache per tenant instead of a global LRU.
    pub cache_partition: bool,
    /// Skip rate limiting while a tenant's cache partition is not fully
    /// populated. Bounded by the unpopulated space; does not suit
    /// write-heavy workloads that keep the cache unpopulated.
    pub unlimited_bandwidth_if_unpopulated_cache: bool,
    /// Distribute leftover CPU strictly by weight instead of favoring
    /// full-hit apps.
    pub strict_weight_distr: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            alloc_enabled: true,
            harvest_enabled: true,
            symm_partition: true,
            avoid_tiny_weight: true,
            strict_cpu_usage: true,
            cache_partition: true,
            unlimited_bandwidth_if_unpopulated_cache: true,
            strict_weight_distr: true,
        }
    }
}

impl Policy {
    /// Apply one `-p` flag from the command line.
    pub fn apply_flag(&mut self, flag: &str) -> Result<(), PolicyError> {
        match flag {
            "NO_ALLOC" => self.alloc_enabled = false,
            "NO_HARVEST" => self.harvest_enabled = false,
            "NO_SYMM_PARTITION" => self.symm_partition = false,
            "NO_AVOID_TINY_WEIGHT" => self.avoid_tiny_weight = false,
            "NO_CACHE_PARTITION" => self.cache_partition = false,
            _ => {
                return Err(PolicyError::UnknownFlag {
                    flag: flag.to_owned(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown policy flag: {flag}")]
    UnknownFlag { flag: String },
    #[error("allocation is too frequent: freq_us={freq_us} cannot cover the stat windows")]
    AllocTooFrequent { freq_us: u64 },
}
