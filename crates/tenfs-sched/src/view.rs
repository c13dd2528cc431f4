//! Cross-worker aggregation of tenant statistics and hit-rate curves.
//!
//! The allocator never touches worker-owned state directly: it reads the
//! atomic counters behind [`crate::TenantStatHandle`] and recomputes its
//! picture of each app every statistics window. Because the ghost curves
//! are being written concurrently, a polled sweep may be internally
//! inconsistent; the basic shape properties (inclusiveness) are
//! re-enforced here on read.

use crate::resrc::{HitRateCnt, ResrcAlloc, ResrcProgress};
use crate::tenant::TenantStatHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tenfs_cache::GhostCurve;
use tenfs_types::AppId;
use tenfs_types::params::{
    self, FULL_HIT_THRESHOLD, MIN_BANDWIDTH, MIN_CACHE_TOTAL, cycles_to_weight,
};
use tracing::{debug, info, warn};

/// Windowed image of one worker's ghost curve.
#[derive(Debug)]
pub struct GhostCacheView {
    curve: Arc<GhostCurve>,
    prev_stat_image: Vec<HitRateCnt>,
    curr_stat_image: Vec<HitRateCnt>,
}

impl GhostCacheView {
    #[must_use]
    pub fn new(curve: Arc<GhostCurve>) -> Self {
        let n = curve.num_ticks();
        let mut view = Self {
            curve,
            prev_stat_image: vec![HitRateCnt::default(); n],
            curr_stat_image: vec![HitRateCnt::default(); n],
        };
        view.reset();
        view
    }

    fn size_at(&self, i: usize) -> u32 {
        self.curve.min_size() + i as u32 * self.curve.tick()
    }

    /// Snapshot the monotone counters as the new baseline.
    pub fn reset(&mut self) {
        for i in 0..self.prev_stat_image.len() {
            self.prev_stat_image[i] = HitRateCnt::from(self.curve.get_stat(self.size_at(i)));
        }
    }

    /// Diff the counters against the baseline. The worker may be updating
    /// them concurrently; strong consistency is not needed, but the view
    /// must stay inclusive — a larger cache may not show fewer hits — so
    /// the sweep is clamped on the way in.
    pub fn poll(&mut self) {
        for i in 0..self.curr_stat_image.len() {
            let s = HitRateCnt::from(self.curve.get_stat(self.size_at(i)));
            self.curr_stat_image[i] = s.since(&self.prev_stat_image[i]);
            if i > 0 {
                if self.curr_stat_image[i].hit_cnt < self.curr_stat_image[i - 1].hit_cnt {
                    self.curr_stat_image[i].hit_cnt = self.curr_stat_image[i - 1].hit_cnt;
                }
                if self.curr_stat_image[i].miss_cnt > self.curr_stat_image[i - 1].miss_cnt {
                    self.curr_stat_image[i].miss_cnt = self.curr_stat_image[i - 1].miss_cnt;
                }
            }
        }
    }

    /// Counters for an arbitrary cache size, interpolating between ticks
    /// and extrapolating below the sweep minimum.
    #[must_use]
    pub fn get_hit_rate_cnt(&self, cache_size: u32) -> HitRateCnt {
        let min = self.curve.min_size();
        let max = self.curve.max_size();
        let tick = self.curve.tick();
        // What-if queries may step past the sweep; the curve is flat there.
        let cache_size = cache_size.min(max);
        if cache_size < min {
            // Below the sweep: scale the smallest tick's hits down and
            // fold the remainder into misses.
            let size_ratio = f64::from(cache_size) / f64::from(min);
            let first = self.curr_stat_image[0];
            return HitRateCnt::new(
                first.hit_cnt * size_ratio,
                first.hit_cnt * (1.0 - size_ratio) + first.miss_cnt,
            );
        }
        let idx = ((cache_size - min) / tick) as usize;
        let left_size = min + idx as u32 * tick;
        if cache_size == left_size {
            return self.curr_stat_image[idx];
        }
        let l_stat = self.curr_stat_image[idx];
        let r_stat = self.curr_stat_image[idx + 1];
        let l_dist = f64::from(cache_size - left_size);
        let r_dist = f64::from(left_size + tick - cache_size);
        let l_ratio = r_dist / (l_dist + r_dist);
        let r_ratio = l_dist / (l_dist + r_dist);
        HitRateCnt::new(
            l_stat.hit_cnt * l_ratio + r_stat.hit_cnt * r_ratio,
            l_stat.miss_cnt * l_ratio + r_stat.miss_cnt * r_ratio,
        )
    }
}

/// An app's ghost curves across workers, aggregated by CPU weight.
///
/// A query for `cache_size` splits the size across workers in proportion
/// to each worker's weight and sums the per-worker counters; repeated
/// queries within one planning pass are memoized until the next poll.
#[derive(Debug, Default)]
pub struct DistrGhostCacheView {
    weight_sum: u32,
    weighted_views: Vec<(u32, GhostCacheView)>,
    hit_rate_map: HashMap<u32, f64>,
}

impl DistrGhostCacheView {
    /// Append order fixes the worker index used by `update_weight`.
    pub fn append(&mut self, curve: Arc<GhostCurve>, weight: u32) {
        assert!(weight <= params::MAX_WEIGHT);
        self.weighted_views.push((weight, GhostCacheView::new(curve)));
        self.weight_sum += weight;
    }

    pub fn update_weight(&mut self, idx: usize, weight: u32) {
        assert!(weight <= params::MAX_WEIGHT);
        let entry = &mut self.weighted_views[idx];
        self.weight_sum = self.weight_sum - entry.0 + weight;
        entry.0 = weight;
    }

    pub fn reset(&mut self) {
        for (_, view) in &mut self.weighted_views {
            view.reset();
        }
    }

    pub fn poll(&mut self) {
        for (_, view) in &mut self.weighted_views {
            view.poll();
        }
        self.hit_rate_map.clear();
    }

    /// Aggregate hit rate at `cache_size`, memoized per planning pass.
    /// Infinite when no worker observed an access.
    pub fn get_hit_rate(&mut self, cache_size: u32) -> f64 {
        if let Some(&rate) = self.hit_rate_map.get(&cache_size) {
            return rate;
        }
        assert!(self.weight_sum > 0, "hit-rate query with zero total weight");
        let mut hrc = HitRateCnt::default();
        for (weight, view) in &self.weighted_views {
            if *weight > 0 {
                let share = (u64::from(*weight) * u64::from(cache_size)
                    / u64::from(self.weight_sum)) as u32;
                hrc += view.get_hit_rate_cnt(share);
            }
        }
        let rate = hrc.hit_rate();
        self.hit_rate_map.insert(cache_size, rate);
        rate
    }

    #[must_use]
    pub fn get_hit_rate_cnt(&self, worker_idx: usize, cache_size: u32) -> HitRateCnt {
        self.weighted_views[worker_idx].1.get_hit_rate_cnt(cache_size)
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.weighted_views.len()
    }

    /// Dump each worker's curve at every tick.
    pub fn log_curves(&self) {
        for (i, (weight, view)) in self.weighted_views.iter().enumerate() {
            if *weight == 0 {
                continue;
            }
            let curve = &view.curve;
            let mut size = curve.min_size();
            while size <= curve.max_size() {
                let hrc = view.get_hit_rate_cnt(size);
                info!(
                    event = "ghost_curve_dump",
                    worker_idx = i,
                    cache_mb = params::blocks_to_mb_int(u64::from(size)),
                    hit = hrc.hit_cnt,
                    miss = hrc.miss_cnt,
                    weight_frac = f64::from(*weight) / f64::from(self.weight_sum)
                );
                size += curve.tick();
            }
        }
    }
}

/// An application's unified resource view: its tenants across workers,
/// their progress in the current window, and the pending per-worker
/// weight partition.
///
/// Invariant: `sum(pending_weights) + pending_weight_unalloc` equals the
/// app's total weight.
#[derive(Debug)]
pub struct AppResrcView {
    pub aid: AppId,
    /// Tenant handles ordered by worker id.
    tenants: Vec<TenantStatHandle>,
    prev_prog: Vec<ResrcProgress>,
    curr_prog: Vec<ResrcProgress>,
    distr_ghost_cache_view: DistrGhostCacheView,
    curr_resrc: ResrcAlloc,
    /// The weights most recently applied via decisions (initially the
    /// configured ones); partitioning prefers stability against them.
    applied_weights: Vec<u32>,
    pending_weight_unalloc: u32,
    pending_weights: Vec<u32>,
    /// Updated by each poll: observed cost of one block, in cycles.
    cycles_per_block: i64,
    /// Observed miss rate from accounting (not from the ghost estimate).
    measured_miss_rate: f64,
    /// Whether per-tenant ghost estimation applies (cache partitioning
    /// on). Under a global LRU only the measured rate is meaningful.
    cache_partition: bool,
    /// Seconds covered by the poll window, for rate logging.
    stat_window_secs: f64,
}

impl AppResrcView {
    #[must_use]
    pub fn new(aid: AppId, cache_partition: bool, stat_window_secs: f64) -> Self {
        Self {
            aid,
            tenants: Vec::new(),
            prev_prog: Vec::new(),
            curr_prog: Vec::new(),
            distr_ghost_cache_view: DistrGhostCacheView::default(),
            curr_resrc: ResrcAlloc::default(),
            applied_weights: Vec::new(),
            pending_weight_unalloc: 0,
            pending_weights: Vec::new(),
            cycles_per_block: i64::MAX,
            measured_miss_rate: f64::INFINITY,
            cache_partition,
            stat_window_secs,
        }
    }

    /// Register one worker's tenant. Must be called in worker-id order.
    pub fn append_tenant(&mut self, handle: TenantStatHandle) {
        let weight = cycles_to_weight(handle.init_resrc.cpu_cycles as u64);
        self.distr_ghost_cache_view
            .append(Arc::clone(&handle.curve), weight);
        self.curr_resrc += handle.init_resrc;
        self.applied_weights.push(weight);
        self.prev_prog.push(ResrcProgress::default());
        self.curr_prog.push(ResrcProgress::default());
        self.pending_weights.push(0);
        self.tenants.push(handle);
    }

    #[must_use]
    pub fn get_resrc(&self) -> ResrcAlloc {
        self.curr_resrc
    }

    pub fn set_resrc(&mut self, resrc: ResrcAlloc) {
        self.curr_resrc = resrc;
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.tenants.len()
    }

    /// The last applied weight per worker.
    #[must_use]
    pub fn get_weights(&self) -> Vec<u32> {
        self.applied_weights.clone()
    }

    /// Record newly applied weights and refresh the ghost aggregation.
    pub fn set_weights(&mut self, weights: &[u32]) {
        for (idx, &w) in weights.iter().enumerate() {
            self.distr_ghost_cache_view.update_weight(idx, w);
        }
        self.applied_weights = weights.to_vec();
    }

    /// Inodes currently placed on each worker.
    #[must_use]
    pub fn num_inodes_per_worker(&self) -> Vec<usize> {
        self.tenants
            .iter()
            .map(|t| t.num_inodes.load(Ordering::Acquire))
            .collect()
    }

    /// Snapshot the current accounting as the new baseline.
    pub fn reset_stat(&mut self) {
        for (i, tenant) in self.tenants.iter().enumerate() {
            self.prev_prog[i] = tenant.acct.snapshot();
        }
        self.distr_ghost_cache_view.reset();
    }

    /// Poll the latest accounting, diff it against the baseline, and
    /// derive the per-window workload profile. Returns whether the app
    /// made any progress.
    pub fn poll_stat(&mut self, silent: bool) -> bool {
        let mut total = ResrcProgress::default();
        self.distr_ghost_cache_view.poll();
        for (i, tenant) in self.tenants.iter().enumerate() {
            self.curr_prog[i] = tenant.acct.snapshot().since(&self.prev_prog[i]);
            total += self.curr_prog[i];
        }

        if total.num_blks_done == 0 {
            self.cycles_per_block = i64::MAX;
            return false;
        }

        self.cycles_per_block = total.cpu_consump / total.num_blks_done;
        self.measured_miss_rate = total.bw_consump as f64 / total.num_blks_done as f64;
        if self.measured_miss_rate.is_finite() && self.measured_miss_rate > 1.0 {
            warn!(
                event = "measured_miss_rate_out_of_range",
                aid = %self.aid,
                bw_consump = total.bw_consump,
                num_blks_done = total.num_blks_done,
                measured_miss_rate = self.measured_miss_rate
            );
            self.measured_miss_rate = 1.0;
        }

        if !silent {
            let window = self.stat_window_secs;
            let mut total_cache_stat = HitRateCnt::default();
            let mut total_num_inodes = 0_usize;
            for (i, tenant) in self.tenants.iter().enumerate() {
                let num_inodes = tenant.num_inodes.load(Ordering::Acquire);
                // The cache this worker actually holds right now; decisions
                // apportion it by file count, so it cannot be re-derived
                // from the CPU weights.
                let cache_size = tenant.cache_size.load(Ordering::Acquire);
                let c = self.distr_ghost_cache_view.get_hit_rate_cnt(i, cache_size);
                log_stat_row(self.aid, &format!("W-{i}"), &self.curr_prog[i], &c, window, num_inodes);
                total_cache_stat += c;
                total_num_inodes += num_inodes;
            }
            log_stat_row(self.aid, "Sum", &total, &total_cache_stat, window, total_num_inodes);
        }
        true
    }

    /// Collect under-used resources. At most one of CPU and bandwidth can
    /// be idle; bandwidth is checked first. Returns `(cpu_idle, bw_idle)`.
    pub fn collect_idle(&mut self) -> (i64, i64) {
        let bw_demand = self.pred_bandwidth_demand();
        let bw_idle = self.curr_resrc.bandwidth - bw_demand;
        if bw_idle > MIN_BANDWIDTH {
            self.curr_resrc.bandwidth = bw_demand;
            info!(
                event = "collect_idle",
                aid = %self.aid,
                cpu_idle = 0_i64,
                bw_idle,
                resrc = %self.curr_resrc
            );
            return (0, bw_idle);
        }
        let cpu_demand = self.pred_cpu_demand();
        let cpu_idle = self.curr_resrc.cpu_cycles.saturating_sub(cpu_demand);
        if cpu_idle > 0 {
            self.curr_resrc.cpu_cycles = cpu_demand;
            info!(
                event = "collect_idle",
                aid = %self.aid,
                cpu_idle,
                bw_idle = 0_i64,
                resrc = %self.curr_resrc
            );
            return (cpu_idle, 0);
        }
        (0, 0) // rounding error territory
    }

    /// CPU needed to fully saturate the allocated bandwidth.
    fn pred_cpu_demand(&mut self) -> i64 {
        let hit_rate = self
            .distr_ghost_cache_view
            .get_hit_rate(self.curr_resrc.cache_size);
        if hit_rate >= FULL_HIT_THRESHOLD {
            return i64::MAX;
        }
        ((self.curr_resrc.bandwidth * self.cycles_per_block) as f64 / (1.0 - hit_rate)) as i64
    }

    /// Bandwidth needed to fully saturate the allocated CPU.
    fn pred_bandwidth_demand(&mut self) -> i64 {
        debug_assert!(self.cycles_per_block > 0);
        let (hit_rate, miss_rate);
        if self.cache_partition {
            hit_rate = self
                .distr_ghost_cache_view
                .get_hit_rate(self.curr_resrc.cache_size);
            if hit_rate.is_infinite() {
                return 0;
            }
            miss_rate = 1.0 - hit_rate;
            if self.measured_miss_rate.is_finite() {
                // Compare on miss rate: it is the metric actually used.
                let error = (miss_rate - self.measured_miss_rate) / self.measured_miss_rate;
                if !(-0.05..=0.05).contains(&error) {
                    warn!(
                        event = "miss_rate_estimate_mismatch",
                        aid = %self.aid,
                        measured_pct = self.measured_miss_rate * 100.0,
                        estimated_pct = miss_rate * 100.0
                    );
                }
            }
        } else {
            if self.measured_miss_rate.is_infinite() {
                return 0;
            }
            hit_rate = 1.0 - self.measured_miss_rate;
            miss_rate = self.measured_miss_rate;
        }
        if hit_rate >= FULL_HIT_THRESHOLD {
            return 0;
        }
        (self.curr_resrc.cpu_cycles as f64 * miss_rate / self.cycles_per_block as f64) as i64
    }

    /// Bandwidth this app could release if given one more `cache_delta`.
    /// Zero aborts the deal: asking for cache while releasing nothing is
    /// never accepted.
    pub fn pred_what_if_more_cache(&mut self) -> i64 {
        const ABORT_OFFER: i64 = 0;
        let old_hit_rate = self
            .distr_ghost_cache_view
            .get_hit_rate(self.curr_resrc.cache_size);
        if old_hit_rate >= FULL_HIT_THRESHOLD || old_hit_rate.is_infinite() {
            return ABORT_OFFER;
        }
        let new_hit_rate = self
            .distr_ghost_cache_view
            .get_hit_rate(self.curr_resrc.cache_size + params::CACHE_DELTA);
        if new_hit_rate.is_infinite() {
            return ABORT_OFFER;
        }
        debug_assert!(old_hit_rate <= new_hit_rate + 1e-9);

        let bandwidth_release = (self.curr_resrc.bandwidth as f64
            * (new_hit_rate - old_hit_rate)
            / (1.0 - old_hit_rate)) as i64;
        debug!(
            event = "what_if_more_cache",
            aid = %self.aid,
            cache_mb = params::blocks_to_mb_int(u64::from(self.curr_resrc.cache_size)),
            old_hit_rate,
            new_hit_rate,
            bw_release_mbps = params::blocks_to_mb_int(bandwidth_release.max(0) as u64)
        );
        bandwidth_release.max(0)
    }

    /// Bandwidth this app must be compensated if it gives up one
    /// `cache_delta`. `i64::MAX` aborts: a compensation no one can afford.
    pub fn pred_what_if_less_cache(&mut self) -> i64 {
        const ABORT_OFFER: i64 = i64::MAX;
        if self.curr_resrc.cache_size <= MIN_CACHE_TOTAL {
            return ABORT_OFFER;
        }
        let old_hit_rate = self
            .distr_ghost_cache_view
            .get_hit_rate(self.curr_resrc.cache_size);
        if old_hit_rate.is_infinite() {
            return ABORT_OFFER;
        }
        let new_hit_rate = self
            .distr_ghost_cache_view
            .get_hit_rate(self.curr_resrc.cache_size - params::CACHE_DELTA);
        if new_hit_rate.is_infinite() {
            return ABORT_OFFER;
        }
        debug_assert!(old_hit_rate >= new_hit_rate - 1e-9);

        // Order matters in these branches.
        let bandwidth_compensate = if new_hit_rate >= FULL_HIT_THRESHOLD {
            0 // still full hit with less cache
        } else if old_hit_rate >= FULL_HIT_THRESHOLD {
            return ABORT_OFFER;
        } else {
            (self.curr_resrc.bandwidth as f64 * (old_hit_rate - new_hit_rate)
                / (1.0 - old_hit_rate)) as i64
        };
        debug!(
            event = "what_if_less_cache",
            aid = %self.aid,
            cache_mb = params::blocks_to_mb_int(u64::from(self.curr_resrc.cache_size)),
            old_hit_rate,
            new_hit_rate,
            bw_compensate_mbps = params::blocks_to_mb_int(bandwidth_compensate.max(0) as u64)
        );
        bandwidth_compensate.max(0)
    }

    // ── Resource adjustments during planning ───────────────────────────

    pub fn add_cache_delta(&mut self) {
        self.curr_resrc.cache_size += params::CACHE_DELTA;
    }

    pub fn minus_cache_delta(&mut self) {
        self.curr_resrc.cache_size -= params::CACHE_DELTA;
    }

    pub fn add_cpu(&mut self, cycles: i64) {
        self.curr_resrc.cpu_cycles += cycles;
    }

    pub fn add_bandwidth(&mut self, bandwidth: i64) {
        self.curr_resrc.bandwidth += bandwidth;
    }

    pub fn turn_blk_rate_limiter(&self, to_on: bool) {
        for tenant in &self.tenants {
            tenant.limiter.turn(to_on);
        }
    }

    pub fn is_full_hit(&mut self) -> bool {
        self.distr_ghost_cache_view
            .get_hit_rate(self.curr_resrc.cache_size)
            >= FULL_HIT_THRESHOLD
    }

    // ── Pending weight partition ───────────────────────────────────────

    pub fn reset_pending_weights(&mut self) {
        for w in &mut self.pending_weights {
            *w = 0;
        }
        self.pending_weight_unalloc = cycles_to_weight(self.curr_resrc.cpu_cycles as u64);
        debug!(
            event = "pending_weight_reset",
            aid = %self.aid,
            pending = self.pending_weight_unalloc
        );
    }

    /// Move `weight_diff` between the unallocated pool and worker
    /// `wid_idx`'s pending weight. Negative diffs hand weight back.
    pub fn add_pending_weight(&mut self, wid_idx: usize, weight_diff: i64) {
        let current = i64::from(self.pending_weights[wid_idx]);
        assert!(current + weight_diff >= 0, "negative pending weight");
        self.pending_weights[wid_idx] = (current + weight_diff) as u32;
        self.pending_weight_unalloc =
            (i64::from(self.pending_weight_unalloc) - weight_diff) as u32;
    }

    #[must_use]
    pub fn pending_weights(&self) -> &[u32] {
        &self.pending_weights
    }

    #[must_use]
    pub fn pending_weight_unalloc(&self) -> u32 {
        self.pending_weight_unalloc
    }

    pub fn log_decision(&mut self) {
        let hit_rate = self
            .distr_ghost_cache_view
            .get_hit_rate(self.curr_resrc.cache_size);
        info!(
            event = "alloc_decision",
            aid = %self.aid,
            cache = self.curr_resrc.cache_size,
            bw = self.curr_resrc.bandwidth,
            cpu = self.curr_resrc.cpu_cycles,
            hit_rate,
            cache_mb = params::blocks_to_mb_int(u64::from(self.curr_resrc.cache_size)),
            bw_mbps = params::blocks_to_mb_int(self.curr_resrc.bandwidth.max(0) as u64),
            cpu_cnt = self.curr_resrc.cpu_cycles as f64
                / params::WORKER_AVAIL_CYCLES_PER_SECOND as f64
        );
    }

    pub fn log_pending_weights(&self) {
        for (wid, &w) in self.pending_weights.iter().enumerate() {
            info!(
                event = "pending_weight",
                aid = %self.aid,
                wid,
                weight = w,
                cpu_cnt = f64::from(w) / f64::from(params::WORKER_AVAIL_WEIGHT)
            );
        }
        if self.pending_weight_unalloc != 0 {
            warn!(
                event = "unallocated_weight",
                aid = %self.aid,
                weight = self.pending_weight_unalloc
            );
        }
    }

    pub fn log_curves(&self) {
        info!(event = "ghost_curve_dump_begin", aid = %self.aid);
        self.distr_ghost_cache_view.log_curves();
    }
}

fn log_stat_row(
    aid: AppId,
    name: &str,
    prog: &ResrcProgress,
    cache_stat: &HitRateCnt,
    window_secs: f64,
    num_inodes: usize,
) {
    let blk_to_gbps = |blocks: i64| blocks as f64 / (256.0 * 1024.0 * window_secs);
    let tp_gbps = blk_to_gbps(prog.num_blks_done);
    let miss_rate = if cache_stat.hit_cnt == 0.0 {
        1.0
    } else {
        cache_stat.miss_cnt / (cache_stat.hit_cnt + cache_stat.miss_cnt)
    };
    let measured_miss_rate = if prog.num_blks_done == 0 {
        1.0
    } else {
        prog.bw_consump as f64 / prog.num_blks_done as f64
    };
    info!(
        event = "app_stat_row",
        aid = %aid,
        row = name,
        tp_gbps,
        bw_gbps = blk_to_gbps(prog.bw_consump),
        cpu_cnt = prog.cpu_consump as f64
            / window_secs
            / params::WORKER_AVAIL_CYCLES_PER_SECOND as f64,
        ghost_hit = cache_stat.hit_cnt,
        ghost_miss = cache_stat.miss_cnt,
        ghost_miss_pct = miss_rate * 100.0,
        measured_miss_pct = measured_miss_rate * 100.0,
        cycles_per_blk = if prog.num_blks_done == 0 {
            0.0
        } else {
            prog.cpu_consump as f64 / prog.num_blks_done as f64
        },
        num_inodes
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateLimiter;
    use crate::resrc::{ResrcAcct, ResrcAlloc};
    use crate::tenant::TenantStatHandle;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use tenfs_cache::{AccessMode, SampledGhostCache};
    use tenfs_types::WorkerId;

    fn fed_ghost(pages: u64, rounds: usize) -> SampledGhostCache {
        let mut ghost = SampledGhostCache::with_sample_shift(4, 4, 32, 0);
        for _ in 0..rounds {
            for page in 0..pages {
                ghost.access(page, AccessMode::Default);
            }
        }
        ghost
    }

    #[test]
    fn ghost_view_diffs_against_baseline() {
        let mut ghost = SampledGhostCache::with_sample_shift(4, 4, 32, 0);
        for page in 0..4_u64 {
            ghost.access(page, AccessMode::Default);
        }
        let mut view = GhostCacheView::new(ghost.curve());
        view.reset();
        // Nothing since the baseline: the window image is empty.
        view.poll();
        let stat = view.get_hit_rate_cnt(32);
        assert_eq!(stat.hit_cnt, 0.0);
        assert_eq!(stat.miss_cnt, 0.0);

        for _ in 0..3 {
            for page in 0..4_u64 {
                ghost.access(page, AccessMode::Default);
            }
        }
        view.poll();
        let stat = view.get_hit_rate_cnt(4);
        assert_eq!(stat.hit_cnt, 12.0);
    }

    #[test]
    fn ghost_view_interpolates_between_ticks() {
        let ghost = fed_ghost(4, 100);
        let mut view = GhostCacheView::new(ghost.curve());
        // The curve was already fed when the baseline was taken; rebuild
        // the window from zero.
        view.prev_stat_image.fill(HitRateCnt::default());
        view.poll();
        let at_4 = view.get_hit_rate_cnt(4);
        let at_8 = view.get_hit_rate_cnt(8);
        let between = view.get_hit_rate_cnt(6);
        let expected = (at_4.hit_cnt + at_8.hit_cnt) / 2.0;
        assert!((between.hit_cnt - expected).abs() < 1e-6);

        // Below the sweep minimum the estimate scales down linearly.
        let below = view.get_hit_rate_cnt(2);
        assert!((below.hit_cnt - at_4.hit_cnt / 2.0).abs() < 1e-6);
        assert!(
            (below.hit_cnt + below.miss_cnt - (at_4.hit_cnt + at_4.miss_cnt)).abs() < 1e-6,
            "total accesses are preserved when extrapolating"
        );
    }

    #[test]
    fn polled_sweep_is_clamped_inclusive() {
        let ghost = fed_ghost(16, 50);
        let mut view = GhostCacheView::new(ghost.curve());
        view.prev_stat_image.fill(HitRateCnt::default());
        view.poll();
        let mut prev = view.get_hit_rate_cnt(4);
        for size in (8..=32).step_by(4) {
            let curr = view.get_hit_rate_cnt(size as u32);
            assert!(curr.hit_cnt >= prev.hit_cnt);
            assert!(curr.miss_cnt <= prev.miss_cnt);
            prev = curr;
        }
    }

    fn test_handle(wid: u32, ghost: &SampledGhostCache, resrc: ResrcAlloc) -> TenantStatHandle {
        TenantStatHandle {
            wid: WorkerId(wid),
            aid: AppId(0),
            acct: Arc::new(ResrcAcct::default()),
            curve: ghost.curve(),
            limiter: Arc::new(RateLimiter::new(resrc.bandwidth)),
            init_resrc: resrc,
            cache_size: Arc::new(AtomicU32::new(resrc.cache_size)),
            num_inodes: Arc::new(AtomicUsize::new(1)),
        }
    }

    #[test]
    fn poll_stat_reports_activity_and_miss_rate() {
        let ghost = fed_ghost(4, 10);
        let resrc = ResrcAlloc {
            cache_size: 16,
            bandwidth: 1000,
            cpu_cycles: 1 << 30,
        };
        let handle = test_handle(0, &ghost, resrc);
        let acct = Arc::clone(&handle.acct);
        let mut view = AppResrcView::new(AppId(0), true, 1.0);
        view.append_tenant(handle);
        view.reset_stat();

        // No progress: the app reads as inactive.
        assert!(!view.poll_stat(true));

        acct.add_blocks_done(100);
        acct.add_bw_consump(40);
        acct.add_cpu_consump(1_000_000);
        assert!(view.poll_stat(true));
        assert_eq!(view.cycles_per_block, 10_000);
        assert!((view.measured_miss_rate - 0.4).abs() < 1e-9);
    }

    #[test]
    fn measured_miss_rate_clamps_to_one() {
        let ghost = fed_ghost(4, 10);
        let resrc = ResrcAlloc {
            cache_size: 16,
            bandwidth: 1000,
            cpu_cycles: 1 << 30,
        };
        let handle = test_handle(0, &ghost, resrc);
        let acct = Arc::clone(&handle.acct);
        let mut view = AppResrcView::new(AppId(0), true, 1.0);
        view.append_tenant(handle);
        view.reset_stat();

        // More submitted blocks than completed ones: out-of-range rate.
        acct.add_blocks_done(10);
        acct.add_bw_consump(15);
        acct.add_cpu_consump(1_000);
        assert!(view.poll_stat(true));
        assert!((view.measured_miss_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn collect_idle_takes_bandwidth_first() {
        // A fully cache-resident app: bandwidth demand is zero, so the
        // entire allocation above the demand is idle.
        let mut ghost = SampledGhostCache::with_sample_shift(4, 4, 32, 0);
        for _ in 0..1000 {
            for page in 0..4_u64 {
                ghost.access(page, AccessMode::Default);
            }
        }
        let resrc = ResrcAlloc {
            cache_size: 16,
            bandwidth: 10_000,
            cpu_cycles: 1 << 30,
        };
        let handle = test_handle(0, &ghost, resrc);
        let acct = Arc::clone(&handle.acct);
        let mut view = AppResrcView::new(AppId(0), true, 1.0);
        view.append_tenant(handle);
        view.set_resrc(resrc);
        view.reset_stat();
        acct.add_blocks_done(4000);
        acct.add_bw_consump(4);
        acct.add_cpu_consump(4_000_000);
        assert!(view.poll_stat(true));

        let (cpu_idle, bw_idle) = view.collect_idle();
        assert_eq!(cpu_idle, 0);
        assert_eq!(bw_idle, 10_000);
        assert_eq!(view.get_resrc().bandwidth, 0);
    }

    #[test]
    fn distr_view_memoizes_until_next_poll() {
        let ghost = fed_ghost(4, 10);
        let mut distr = DistrGhostCacheView::default();
        distr.append(ghost.curve(), 100);
        distr.poll();
        let first = distr.get_hit_rate(16);
        let again = distr.get_hit_rate(16);
        assert_eq!(first.to_bits(), again.to_bits());
        assert_eq!(distr.hit_rate_map.len(), 1);
        distr.poll();
        assert!(distr.hit_rate_map.is_empty());
    }
}
