//! Periodic cache-aware resource allocator.
//!
//! Every `freq_us` the allocator snapshots per-app statistics over a
//! collection window, then plans: reset everyone to the equal baseline,
//! collect idle CPU/bandwidth, trade cache for bandwidth between apps
//! (harvest), distribute the proceeds, partition each app's CPU weight
//! across workers, and ship one [`AllocDecision`] per (app, worker).
//!
//! The primary goal is maximizing the minimum improvement, so planning
//! stops when that metric cannot improve further; the allocator is not
//! work-conserving — CPU can be left idle even when some app wants more.

use crate::resrc::ResrcAlloc;
use crate::view::AppResrcView;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tenfs_types::params::{
    MIN_BANDWIDTH_HARVEST, SOFT_MIN_WEIGHT, WORKER_AVAIL_CYCLES_PER_SECOND, WORKER_AVAIL_WEIGHT,
    weight_to_cycles,
};
use tenfs_types::{AllocTiming, AppId, Policy, WorkerId};
use tracing::{debug, info, warn};

/// The allocation shipped to one worker for one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocDecision {
    pub aid: AppId,
    /// `(dst_wid, num_files)` migrations this worker must perform.
    pub inode_move: Vec<(WorkerId, usize)>,
    pub resrc: ResrcAlloc,
}

/// Where decisions go; the server wires this to its messenger.
pub trait DecisionSink: Send + Sync {
    fn send_decision(&self, wid: WorkerId, decision: AllocDecision);
}

pub struct Allocator {
    total_resrc: ResrcAlloc,
    base_resrc: ResrcAlloc,
    views: Vec<AppResrcView>,
    num_workers: usize,
    policy: Policy,
    timing: AllocTiming,
    sink: Arc<dyn DecisionSink>,
}

/// Running allocator thread; joins on shutdown or drop.
#[derive(Debug)]
pub struct AllocatorHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl AllocatorHandle {
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for AllocatorHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Sleep in small slices so a stop request is honored promptly.
/// Returns false when stopped.
fn sleep_with_stop(stop: &AtomicBool, micros: u64) -> bool {
    const SLICE_US: u64 = 50_000;
    let mut remaining = micros;
    while remaining > 0 {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let slice = remaining.min(SLICE_US);
        thread::sleep(Duration::from_micros(slice));
        remaining -= slice;
    }
    !stop.load(Ordering::Acquire)
}

impl Allocator {
    #[must_use]
    pub fn new(
        num_workers: usize,
        policy: Policy,
        timing: AllocTiming,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        Self {
            total_resrc: ResrcAlloc::default(),
            base_resrc: ResrcAlloc::default(),
            views: Vec::new(),
            num_workers,
            policy,
            timing,
            sink,
        }
    }

    /// Views must be appended in app-id order.
    pub fn append_view(&mut self, aid: AppId) -> &mut AppResrcView {
        assert_eq!(aid.0 as usize, self.views.len(), "views must be ordered by aid");
        let window_secs = self.timing.stat_coll_window_us as f64 / 1e6;
        self.views
            .push(AppResrcView::new(aid, self.policy.cache_partition, window_secs));
        self.views.last_mut().expect("just pushed")
    }

    /// Fold one app's configured resources into the machine total and
    /// recompute the equal-share baseline.
    pub fn add_total_resrc(&mut self, resrc: ResrcAlloc) {
        self.total_resrc += resrc;
        self.base_resrc = self.total_resrc / self.views.len();
    }

    #[must_use]
    pub fn views(&self) -> &[AppResrcView] {
        &self.views
    }

    /// Move the allocator onto its own thread.
    #[must_use]
    pub fn spawn(self) -> AllocatorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("allocator".into())
            .spawn(move || {
                let mut allocator = self;
                allocator.run(&thread_stop);
            })
            .expect("failed to spawn allocator thread");
        AllocatorHandle {
            stop,
            join: Some(join),
        }
    }

    /// Main loop. Waits until every app makes progress, preheats so the
    /// caches populate, then runs stat-collect / plan / stabilize epochs
    /// until stopped.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(event = "allocator_started", num_apps = self.views.len());
        for view in &mut self.views {
            view.reset_stat();
        }
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let mut are_all_active = true;
            for view in &mut self.views {
                are_all_active &= view.poll_stat(true);
            }
            if are_all_active {
                // Populating the caches takes a while; give the apps a
                // head start before the first allocation.
                if !sleep_with_stop(stop, self.timing.preheat_window_us) {
                    return;
                }
                break;
            }
            if !sleep_with_stop(stop, 1_000) {
                return;
            }
        }

        while !stop.load(Ordering::Acquire) {
            for view in &mut self.views {
                view.reset_stat();
            }
            if !sleep_with_stop(stop, self.timing.stat_coll_window_us) {
                return;
            }

            // An inactive client means the system is unstable or still
            // warming up; planning on such a window would misallocate.
            let mut are_all_active = true;
            for view in &mut self.views {
                let is_active = view.poll_stat(false);
                if !is_active {
                    info!(event = "app_inactive", aid = %view.aid);
                }
                are_all_active &= is_active;
            }

            if are_all_active {
                if self.policy.alloc_enabled {
                    self.do_alloc();
                }
                if self.timing.unlimited_bandwidth_window_us > 0 {
                    // Let tenants overshoot their bandwidth briefly to
                    // bring their caches to the new steady state.
                    info!(event = "rate_limiters_off");
                    for view in &self.views {
                        view.turn_blk_rate_limiter(false);
                    }
                    let _ = sleep_with_stop(stop, self.timing.unlimited_bandwidth_window_us);
                    info!(event = "rate_limiters_on");
                    for view in &self.views {
                        view.turn_blk_rate_limiter(true);
                    }
                }
            } else {
                info!(event = "alloc_skipped_inactive");
                if !sleep_with_stop(stop, self.timing.unlimited_bandwidth_window_us) {
                    return;
                }
            }

            if !sleep_with_stop(stop, self.timing.stabilize_window_us()) {
                return;
            }
        }
    }

    fn do_alloc(&mut self) {
        if self.views.len() <= 1 {
            return; // nothing to schedule for a single client
        }

        // Start every app from the equal-share baseline.
        for view in &mut self.views {
            view.set_resrc(self.base_resrc);
        }
        info!(event = "alloc_baseline", resrc = %self.base_resrc);

        let mut cpu_avail: i64 = 0;
        let mut bw_avail: i64 = 0;
        for view in &mut self.views {
            let (cpu_idle, bw_idle) = view.collect_idle();
            assert!(cpu_idle >= 0 && bw_idle >= 0);
            cpu_avail += cpu_idle;
            bw_avail += bw_idle;
        }
        info!(event = "alloc_after_idle", cpu_avail, bw_avail);

        if self.policy.harvest_enabled && self.policy.cache_partition {
            // Without cache partitioning there is no per-tenant cache to
            // trade, hence no harvest.
            bw_avail += self.do_harvest();
            info!(event = "alloc_after_harvest", cpu_avail, bw_avail);
        }

        assert!(cpu_avail >= 0 && bw_avail >= 0);
        'distribute: {
            if bw_avail == 0 && cpu_avail == 0 {
                break 'distribute;
            }
            cpu_avail = self.do_distribute(cpu_avail, bw_avail);
            if cpu_avail == 0 {
                break 'distribute;
            }

            // Full-hit clients are not bandwidth-bottlenecked, so spare
            // CPU helps them directly.
            debug_assert!(!self.policy.strict_weight_distr);
            let mut full_hit_cpu_sum: i64 = 0;
            for view in &mut self.views {
                if view.is_full_hit() {
                    full_hit_cpu_sum += view.get_resrc().cpu_cycles;
                }
            }
            if full_hit_cpu_sum > 0 {
                let cpu_avail_total = cpu_avail;
                for view in &mut self.views {
                    if view.is_full_hit() {
                        let cpu_return = (cpu_avail_total as f64 / full_hit_cpu_sum as f64
                            * view.get_resrc().cpu_cycles as f64)
                            as i64;
                        view.add_cpu(cpu_return);
                        cpu_avail -= cpu_return;
                        assert!(cpu_avail >= 0);
                        info!(event = "cpu_to_full_hit", aid = %view.aid, cpu = cpu_return);
                    }
                }
            }

            // Fallback: return CPU to apps below baseline, clamped to it.
            for view in &mut self.views {
                assert!(cpu_avail >= 0);
                if cpu_avail == 0 {
                    break;
                }
                let cpu_diff = self.base_resrc.cpu_cycles - view.get_resrc().cpu_cycles;
                if cpu_diff > 0 {
                    let cpu_return = cpu_diff.min(cpu_avail);
                    cpu_avail -= cpu_return;
                    info!(event = "cpu_to_baseline", aid = %view.aid, cpu = cpu_return);
                    view.add_cpu(cpu_return);
                }
            }
        }

        info!(event = "alloc_decision_begin");
        for view in &mut self.views {
            view.log_decision();
        }
        self.do_apply();
    }

    /// Harvest bandwidth by relocating cache between apps. Greedy: match
    /// the best release offer against the cheapest compensation demand,
    /// deal one `cache_delta` at a time, re-evaluate only the two parties,
    /// and stop when no deal clears the minimum profit. Returns the
    /// bandwidth harvested.
    fn do_harvest(&mut self) -> i64 {
        let mut bw_harvested: i64 = 0;

        let mut bw_rel_list: Vec<(i64, usize)> = Vec::with_capacity(self.views.len());
        let mut bw_comp_list: Vec<(i64, usize)> = Vec::with_capacity(self.views.len());
        for i in 0..self.views.len() {
            bw_rel_list.push((self.views[i].pred_what_if_more_cache(), i));
            bw_comp_list.push((self.views[i].pred_what_if_less_cache(), i));
        }

        let mut trade_round: u32 = 0;
        while trade_round < self.timing.max_trade_round {
            bw_rel_list.sort_by(|l, r| r.0.cmp(&l.0).then(l.1.cmp(&r.1)));
            bw_comp_list.sort_by(|l, r| l.0.cmp(&r.0).then(l.1.cmp(&r.1)));
            let (bw_rel, rel_idx) = bw_rel_list[0];
            let (mut bw_comp, mut comp_idx) = bw_comp_list[0];
            if rel_idx == comp_idx {
                // Rare: the best release and compensation are the same
                // client; use the second-cheapest compensation instead.
                (bw_comp, comp_idx) = bw_comp_list[1];
            }
            if bw_rel.saturating_sub(bw_comp) <= MIN_BANDWIDTH_HARVEST {
                break; // no further profitable deal
            }

            debug!(
                event = "harvest_deal",
                releaser = %self.views[rel_idx].aid,
                compensated = %self.views[comp_idx].aid,
                bw_rel,
                bw_comp
            );
            self.views[rel_idx].add_cache_delta();
            self.views[comp_idx].minus_cache_delta();
            self.views[rel_idx].add_bandwidth(-bw_rel);
            self.views[comp_idx].add_bandwidth(bw_comp);
            bw_harvested += bw_rel - bw_comp;

            // Only the two parties' predictions changed.
            let mut done_cnt = 0;
            for i in 0..bw_rel_list.len() {
                if done_cnt >= 4 {
                    break;
                }
                let idx = bw_rel_list[i].1;
                if idx == rel_idx || idx == comp_idx {
                    bw_rel_list[i].0 = self.views[idx].pred_what_if_more_cache();
                    done_cnt += 1;
                }
                let idx = bw_comp_list[i].1;
                if idx == rel_idx || idx == comp_idx {
                    bw_comp_list[i].0 = self.views[idx].pred_what_if_less_cache();
                    done_cnt += 1;
                }
            }
            trade_round += 1;
        }
        info!(event = "harvest_done", rounds = trade_round, bw_harvested);
        bw_harvested
    }

    /// Distribute available bandwidth (all of it) and CPU (as much as the
    /// expected improvement warrants). Returns undistributed CPU.
    fn do_distribute(&mut self, mut cpu_avail: i64, mut bw_avail: i64) -> i64 {
        let bw_sum = self.total_resrc.bandwidth - bw_avail;
        assert!(bw_sum >= 0);
        let mut improve_ratio = 0.0;
        if bw_sum > 0 {
            // Common case: grow everyone's bandwidth proportionally.
            let bw_avail_total = bw_avail;
            improve_ratio = bw_avail as f64 / bw_sum as f64;
            info!(
                event = "bw_distribute",
                expected_improvement_pct = improve_ratio * 100.0
            );
            for view in &mut self.views {
                let r = view.get_resrc();
                if r.bandwidth == 0 {
                    continue;
                }
                let bw_distr = bw_avail_total * r.bandwidth / bw_sum;
                view.add_bandwidth(bw_distr);
                bw_avail -= bw_distr;
                assert!(bw_avail >= 0);
            }
        } else {
            // Everyone is a full hit; share equally.
            let n = self.views.len() as i64;
            for view in &mut self.views {
                view.add_bandwidth(bw_avail / n);
            }
            bw_avail -= bw_avail / n * n;
        }
        if bw_avail > 0 {
            // Rounding residue; hand it to the first client.
            self.views[0].add_bandwidth(bw_avail);
        }

        let cpu_sum = self.total_resrc.cpu_cycles - cpu_avail;
        assert!(cpu_sum > 0, "all CPU cannot be idle");
        if self.policy.strict_weight_distr
            || improve_ratio * cpu_sum as f64 > cpu_avail as f64
        {
            // Strict-weight policy, or demand exceeds supply: share by
            // current CPU weight.
            info!(
                event = "cpu_distribute_by_weight",
                expected_improvement_pct =
                    (cpu_avail as f64 / cpu_sum as f64).min(improve_ratio) * 100.0
            );
            let cpu_avail_total = cpu_avail;
            for view in &mut self.views {
                let r = view.get_resrc();
                let cpu_distr =
                    (cpu_avail_total as f64 / cpu_sum as f64 * r.cpu_cycles as f64) as i64;
                view.add_cpu(cpu_distr);
                cpu_avail -= cpu_distr;
            }
            assert!(cpu_avail >= 0);
            if cpu_avail > 0 {
                self.views[0].add_cpu(cpu_avail);
            }
            0
        } else {
            // Give CPU only where the bandwidth growth demands it.
            info!(
                event = "cpu_distribute_by_demand",
                expected_improvement_pct = improve_ratio * 100.0
            );
            for view in &mut self.views {
                let r = view.get_resrc();
                let cpu_distr = (improve_ratio * r.cpu_cycles as f64) as i64;
                view.add_cpu(cpu_distr);
                cpu_avail -= cpu_distr;
            }
            cpu_avail
        }
    }

    /// Turn each app's planned CPU into per-worker weights, then into
    /// per-worker decisions.
    fn do_apply(&mut self) {
        for view in &mut self.views {
            view.reset_pending_weights();
        }

        if self.policy.symm_partition {
            self.do_symm_partition();
        } else if self.policy.avoid_tiny_weight {
            self.do_asymm_partition_avoid_tiny();
        } else {
            self.do_asymm_partition_naive();
        }

        for i in 0..self.views.len() {
            self.views[i].log_pending_weights();
            self.do_apply_to_app(i);
        }
    }

    /// Spread each app's weight evenly across all workers, pushing
    /// rounding residue one unit at a time onto workers with room.
    fn do_symm_partition(&mut self) {
        let num_workers = self.num_workers;
        let mut per_worker_avail_weight = WORKER_AVAIL_WEIGHT;

        for view in &mut self.views {
            let per_worker_weight = view.pending_weight_unalloc() / num_workers as u32;
            for wid in 0..num_workers {
                view.add_pending_weight(wid, i64::from(per_worker_weight));
            }
            per_worker_avail_weight = per_worker_avail_weight.saturating_sub(per_worker_weight);
        }
        if per_worker_avail_weight == 0 {
            return;
        }

        let mut workers_avail_weight = vec![WORKER_AVAIL_WEIGHT; num_workers];
        for view in &mut self.views {
            let leftover = view.pending_weight_unalloc();
            if leftover == 0 {
                continue;
            }
            info!(event = "symm_rounding_leftover", aid = %view.aid, leftover);
            assert!(
                (leftover as usize) < num_workers,
                "leftover beyond rounding must not happen"
            );
            for wid in 0..num_workers {
                if view.pending_weight_unalloc() == 0 {
                    break;
                }
                if workers_avail_weight[wid] > 0 {
                    view.add_pending_weight(wid, 1);
                    workers_avail_weight[wid] -= 1;
                }
            }
        }
    }

    /// Greedy asymmetric partition: CPU-light apps first (they are
    /// likely bandwidth-bound and spread better), then by descending CPU;
    /// weight lands on the workers already holding the most of it, which
    /// keeps placements stable across re-runs.
    fn do_asymm_partition_naive(&mut self) {
        let num_workers = self.num_workers;
        let mut workers_avail_weight = vec![WORKER_AVAIL_WEIGHT; num_workers];

        let mut order: Vec<usize> = (0..self.views.len()).collect();
        order.sort_by(|&l, &r| {
            let l_more = self.views[l].get_resrc().cpu_cycles
                > WORKER_AVAIL_CYCLES_PER_SECOND as i64;
            let r_more = self.views[r].get_resrc().cpu_cycles
                > WORKER_AVAIL_CYCLES_PER_SECOND as i64;
            l_more.cmp(&r_more).then_with(|| {
                self.views[r]
                    .get_resrc()
                    .cpu_cycles
                    .cmp(&self.views[l].get_resrc().cpu_cycles)
            })
        });

        for view_idx in order {
            let old_weights = self.views[view_idx].get_weights();
            let mut distr_list: Vec<(usize, u32)> =
                (0..num_workers).map(|wid| (wid, old_weights[wid])).collect();
            distr_list.sort_by(|l, r| r.1.cmp(&l.1).then(l.0.cmp(&r.0)));

            // Optimal for two apps, merely reasonable beyond that.
            let view = &mut self.views[view_idx];
            for (wid, _) in distr_list {
                if view.pending_weight_unalloc() == 0 {
                    break;
                }
                let alloc_weight = view.pending_weight_unalloc().min(workers_avail_weight[wid]);
                view.add_pending_weight(wid, i64::from(alloc_weight));
                workers_avail_weight[wid] -= alloc_weight;
            }
        }
    }

    /// Asymmetric partition that avoids tiny leftover weights: hand out
    /// dedicated workers first; if an app's leftover is below the soft
    /// minimum, split one of its dedicated workers in half to grow the
    /// leftover; place leftovers on the workers with the most room.
    fn do_asymm_partition_avoid_tiny(&mut self) {
        let num_workers = self.num_workers;
        let mut avail_dedi_workers: Vec<usize> = (0..num_workers).collect();
        // A worker's availability is either full (listed above) or
        // tracked here after the dedicated phase.
        let mut workers_avail_weight = vec![0_u32; num_workers];

        // 1. Dedicated workers wherever a full worker's weight fits.
        for view_idx in 0..self.views.len() {
            let old_weights = self.views[view_idx].get_weights();
            // Popped from the back, so keep the preferred worker last:
            // the one already holding the most of this app.
            avail_dedi_workers.sort_by(|&l, &r| {
                old_weights[l].cmp(&old_weights[r]).then(r.cmp(&l))
            });
            let view = &mut self.views[view_idx];
            while view.pending_weight_unalloc() >= WORKER_AVAIL_WEIGHT {
                let wid = avail_dedi_workers
                    .pop()
                    .expect("total weight never exceeds total worker capacity");
                view.add_pending_weight(wid, i64::from(WORKER_AVAIL_WEIGHT));
                info!(event = "dedicated_worker", aid = %view.aid, wid);
            }
        }

        // 2. Partition the partial workers.
        for &wid in &avail_dedi_workers {
            debug_assert_eq!(workers_avail_weight[wid], 0);
            workers_avail_weight[wid] = WORKER_AVAIL_WEIGHT;
        }
        avail_dedi_workers.clear();

        for view_idx in 0..self.views.len() {
            let view = &mut self.views[view_idx];
            // 2.1 A tiny leftover is fragile under hotness skew: break a
            // dedicated worker in half so the leftover grows.
            if view.pending_weight_unalloc() < SOFT_MIN_WEIGHT {
                info!(
                    event = "tiny_leftover_split",
                    aid = %view.aid,
                    leftover = view.pending_weight_unalloc()
                );
                for wid in (0..num_workers).rev() {
                    if view.pending_weights()[wid] == 0 {
                        continue;
                    }
                    assert_eq!(view.pending_weights()[wid], WORKER_AVAIL_WEIGHT);
                    let w_move =
                        (view.pending_weights()[wid] - view.pending_weight_unalloc()) / 2;
                    view.add_pending_weight(wid, -i64::from(w_move));
                    workers_avail_weight[wid] += w_move;
                    info!(event = "split_dedicated", aid = %view.aid, wid, weight = w_move);
                    break;
                }
            }

            // Fill the leftover from the workers with the most room.
            let mut curr_avail_list: Vec<(usize, u32)> = (0..num_workers)
                .map(|wid| (wid, workers_avail_weight[wid]))
                .collect();
            curr_avail_list.sort_by(|l, r| r.1.cmp(&l.1).then(l.0.cmp(&r.0)));
            for (wid, w_avail) in curr_avail_list {
                if view.pending_weight_unalloc() == 0 {
                    break;
                }
                let w_alloc = w_avail.min(view.pending_weight_unalloc());
                info!(event = "leftover_placed", aid = %view.aid, wid, weight = w_alloc);
                view.add_pending_weight(wid, i64::from(w_alloc));
                workers_avail_weight[wid] -= w_alloc;
            }
        }
    }

    /// Translate one app's pending weights into file placement, compute
    /// the migrations realizing it, and ship per-worker decisions.
    fn do_apply_to_app(&mut self, view_idx: usize) {
        let num_workers = self.num_workers;
        let sink = Arc::clone(&self.sink);
        let symm_partition = self.policy.symm_partition;
        let view = &mut self.views[view_idx];
        assert_eq!(
            view.pending_weight_unalloc(),
            0,
            "weight partition left weight unallocated"
        );
        info!(event = "apply_to_app", aid = %view.aid);

        let nfiles_curr = view.num_inodes_per_worker();
        let weights = view.pending_weights().to_vec();
        let total_num_files: usize = nfiles_curr.iter().sum();
        let app_total_weight: u64 = weights.iter().map(|&w| u64::from(w)).sum();

        // Files follow weights, with the remainder going to the workers
        // with the largest fractional residue.
        let mut nfiles_next = vec![0_usize; num_workers];
        if total_num_files > 0 && app_total_weight > 0 {
            let mut nfiles_diff = vec![0.0_f64; num_workers];
            for wid in 0..num_workers {
                let weighted =
                    total_num_files as f64 * f64::from(weights[wid]) / app_total_weight as f64;
                nfiles_next[wid] = weighted.floor() as usize;
                nfiles_diff[wid] = weighted - weighted.floor();
            }
            let mut nfiles_remain = total_num_files - nfiles_next.iter().sum::<usize>();
            while nfiles_remain > 0 {
                let wid = nfiles_diff
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .expect("non-empty worker set");
                nfiles_next[wid] += 1;
                nfiles_diff[wid] -= 1.0;
                nfiles_remain -= 1;
            }
        } else if total_num_files > 0 {
            // All-zero weights: keep files where they are.
            warn!(event = "apply_zero_weight", aid = %view.aid);
            nfiles_next.copy_from_slice(&nfiles_curr);
        }
        info!(
            event = "file_placement",
            aid = %view.aid,
            curr = ?nfiles_curr,
            next = ?nfiles_next
        );

        // Match overfull workers to underfull ones.
        let mut inode_move: Vec<Vec<(WorkerId, usize)>> = vec![Vec::new(); num_workers];
        {
            let mut src_apps: Vec<(usize, usize)> = Vec::new();
            let mut dst_apps: Vec<(usize, usize)> = Vec::new();
            for wid in 0..num_workers {
                let curr_n = nfiles_curr[wid];
                let next_n = nfiles_next[wid];
                if curr_n > next_n {
                    src_apps.push((wid, curr_n - next_n));
                } else if curr_n < next_n {
                    dst_apps.push((wid, next_n - curr_n));
                }
            }
            for (src_wid, mut n) in src_apps {
                for (dst_wid, m) in &mut dst_apps {
                    if *m == 0 {
                        continue;
                    }
                    let num_files_to_migrate = n.min(*m);
                    *m -= num_files_to_migrate;
                    n -= num_files_to_migrate;
                    inode_move[src_wid].push((WorkerId(*dst_wid as u32), num_files_to_migrate));
                    if n == 0 {
                        break;
                    }
                }
            }
        }

        for wid in 0..num_workers {
            if inode_move[wid].is_empty() {
                continue;
            }
            if symm_partition {
                // Under symmetric partition, migration only shows up while
                // a benchmark is tearing files down; ignore it.
                warn!(
                    event = "unexpected_inode_move",
                    aid = %view.aid,
                    wid,
                    "no migration expected under symmetric partition"
                );
                inode_move[wid].clear();
                continue;
            }
            for &(dst_wid, nfiles) in &inode_move[wid] {
                info!(
                    event = "inode_move_planned",
                    aid = %view.aid,
                    src_wid = wid,
                    dst_wid = %dst_wid,
                    nfiles
                );
            }
        }

        let app_total_resrc = view.get_resrc();
        for (wid, moves) in inode_move.into_iter().enumerate() {
            let fraction = if total_num_files == 0 {
                1.0 / num_workers as f64
            } else {
                nfiles_next[wid] as f64 / total_num_files as f64
            };
            let decision = AllocDecision {
                aid: view.aid,
                inode_move: moves,
                resrc: ResrcAlloc {
                    cache_size: (f64::from(app_total_resrc.cache_size) * fraction).ceil() as u32,
                    bandwidth: (app_total_resrc.bandwidth as f64 * fraction).ceil() as i64,
                    cpu_cycles: weight_to_cycles(weights[wid]) as i64,
                },
            };
            info!(
                event = "decision_sent",
                aid = %view.aid,
                wid,
                cache = decision.resrc.cache_size,
                bw = decision.resrc.bandwidth,
                cpu = decision.resrc.cpu_cycles
            );
            sink.send_decision(WorkerId(wid as u32), decision);
        }
        view.set_weights(&weights);
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("num_apps", &self.views.len())
            .field("num_workers", &self.num_workers)
            .field("total_resrc", &self.total_resrc)
            .finish_non_exhaustive()
    }
}
