//! Resource allocation, accounting, and hit-rate arithmetic.
//!
//! Units are uniform across the core: cache in blocks, bandwidth in
//! blocks/second, CPU in cycles/second. User-facing MiB values are
//! converted at the configuration boundary.

use crate::rate::RateLimiter;
use std::fmt;
use std::ops::{Add, AddAssign, Div};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tenfs_cache::{CacheStat, SampledGhostCache};

/// One tenant's (or one app's) allocated share of the three resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResrcAlloc {
    /// Unit: blocks.
    pub cache_size: u32,
    /// Unit: blocks/second.
    pub bandwidth: i64,
    /// Unit: cycles/second.
    pub cpu_cycles: i64,
}

impl Add for ResrcAlloc {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            cache_size: self.cache_size + other.cache_size,
            bandwidth: self.bandwidth + other.bandwidth,
            cpu_cycles: self.cpu_cycles + other.cpu_cycles,
        }
    }
}

impl AddAssign for ResrcAlloc {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Div<usize> for ResrcAlloc {
    type Output = Self;

    /// Equal split across `div` holders.
    fn div(self, div: usize) -> Self {
        Self {
            cache_size: self.cache_size / div as u32,
            bandwidth: self.bandwidth / div as i64,
            cpu_cycles: self.cpu_cycles / div as i64,
        }
    }
}

impl fmt::Display for ResrcAlloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{cache={}, bw={}, cpu={}}}",
            self.cache_size, self.bandwidth, self.cpu_cycles
        )
    }
}

/// Monotone consumption counters, written by the owning worker with
/// release semantics and read by the allocator. The flow is assumed
/// stable, so totals suffice; the allocator diffs snapshots per window.
#[derive(Debug, Default)]
pub struct ResrcAcct {
    num_blks_done: AtomicI64,
    bw_consump: AtomicI64,
    cpu_consump: AtomicI64,
}

impl ResrcAcct {
    pub fn add_blocks_done(&self, blocks: u32) {
        self.num_blks_done.fetch_add(i64::from(blocks), Ordering::Release);
    }

    pub fn add_bw_consump(&self, blocks: u32) {
        self.bw_consump.fetch_add(i64::from(blocks), Ordering::Release);
    }

    pub fn add_cpu_consump(&self, cycles: u64) {
        self.cpu_consump.fetch_add(cycles as i64, Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self) -> ResrcProgress {
        ResrcProgress {
            num_blks_done: self.num_blks_done.load(Ordering::Acquire),
            bw_consump: self.bw_consump.load(Ordering::Acquire),
            cpu_consump: self.cpu_consump.load(Ordering::Acquire),
        }
    }
}

/// Plain snapshot of [`ResrcAcct`], and the unit of progress arithmetic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResrcProgress {
    /// Blocks served (throughput).
    pub num_blks_done: i64,
    /// Blocks submitted to the device.
    pub bw_consump: i64,
    /// Cycles spent processing requests.
    pub cpu_consump: i64,
}

impl ResrcProgress {
    /// Progress since `baseline`. Counters are monotone; a negative diff
    /// means corrupted accounting.
    #[must_use]
    pub fn since(&self, baseline: &Self) -> Self {
        debug_assert!(self.num_blks_done >= baseline.num_blks_done);
        debug_assert!(self.bw_consump >= baseline.bw_consump);
        debug_assert!(self.cpu_consump >= baseline.cpu_consump);
        Self {
            num_blks_done: self.num_blks_done - baseline.num_blks_done,
            bw_consump: self.bw_consump - baseline.bw_consump,
            cpu_consump: self.cpu_consump - baseline.cpu_consump,
        }
    }
}

impl AddAssign for ResrcProgress {
    fn add_assign(&mut self, other: Self) {
        self.num_blks_done += other.num_blks_done;
        self.bw_consump += other.bw_consump;
        self.cpu_consump += other.cpu_consump;
    }
}

impl fmt::Display for ResrcProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[done={},bw={},cpu={}]",
            self.num_blks_done, self.bw_consump, self.cpu_consump
        )
    }
}

/// Hit/miss counts with the arithmetic the views need. Fractional because
/// interpolation between ghost ticks produces non-integer counts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HitRateCnt {
    pub hit_cnt: f64,
    pub miss_cnt: f64,
}

impl HitRateCnt {
    #[must_use]
    pub fn new(hit_cnt: f64, miss_cnt: f64) -> Self {
        Self { hit_cnt, miss_cnt }
    }

    /// Hit rate, or `f64::INFINITY` when no access was observed — the
    /// sentinel every consumer checks before trusting the value.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_cnt + self.miss_cnt;
        if total == 0.0 {
            return f64::INFINITY;
        }
        self.hit_cnt / total
    }

    /// Difference from an earlier reading of the same counters; clamped
    /// at zero because the reader may race the writer.
    #[must_use]
    pub fn since(&self, baseline: &Self) -> Self {
        Self {
            hit_cnt: (self.hit_cnt - baseline.hit_cnt).max(0.0),
            miss_cnt: (self.miss_cnt - baseline.miss_cnt).max(0.0),
        }
    }
}

impl From<CacheStat> for HitRateCnt {
    fn from(stat: CacheStat) -> Self {
        Self {
            hit_cnt: stat.hit_cnt as f64,
            miss_cnt: stat.miss_cnt as f64,
        }
    }
}

impl Add for HitRateCnt {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            hit_cnt: self.hit_cnt + other.hit_cnt,
            miss_cnt: self.miss_cnt + other.miss_cnt,
        }
    }
}

impl AddAssign for HitRateCnt {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl fmt::Display for HitRateCnt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[hit={:.0},miss={:.0}]", self.hit_cnt, self.miss_cnt)
    }
}

/// A tenant's resource-control state: the current allocation, the rate
/// limiter pacing its block submissions, and its ghost cache.
#[derive(Debug)]
pub struct ResrcCtrlBlock {
    pub curr_resrc: ResrcAlloc,
    pub blk_rate_limiter: Arc<RateLimiter>,
    pub ghost_cache: SampledGhostCache,
}

impl ResrcCtrlBlock {
    #[must_use]
    pub fn new(resrc: ResrcAlloc, ghost_cache: SampledGhostCache) -> Self {
        Self {
            curr_resrc: resrc,
            blk_rate_limiter: Arc::new(RateLimiter::new(resrc.bandwidth)),
            ghost_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_arithmetic() {
        let a = ResrcAlloc {
            cache_size: 100,
            bandwidth: 1000,
            cpu_cycles: 1 << 30,
        };
        let sum = a + a;
        assert_eq!(sum.cache_size, 200);
        assert_eq!(sum / 2, a);
    }

    #[test]
    fn acct_snapshot_diff() {
        let acct = ResrcAcct::default();
        acct.add_blocks_done(10);
        acct.add_bw_consump(4);
        acct.add_cpu_consump(1000);
        let first = acct.snapshot();
        acct.add_blocks_done(5);
        let diff = acct.snapshot().since(&first);
        assert_eq!(diff.num_blks_done, 5);
        assert_eq!(diff.bw_consump, 0);
        assert_eq!(diff.cpu_consump, 0);
    }

    #[test]
    fn hit_rate_sentinel_when_empty() {
        assert!(HitRateCnt::default().hit_rate().is_infinite());
        let hrc = HitRateCnt::new(3.0, 1.0);
        assert!((hrc.hit_rate() - 0.75).abs() < 1e-9);
    }
}
