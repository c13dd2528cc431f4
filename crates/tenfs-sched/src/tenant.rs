//! Per-(worker, app) scheduling entity.
//!
//! Unlike the app connection itself, a `Tenant` exists purely for
//! scheduling: it owns the request queues, its allocated share of each
//! resource, and the accounting the allocator reads. A tenant belongs to
//! one worker, so none of its plain state needs locks; an app with
//! tenants on several workers is aggregated by `AppResrcView`.
//!
//! CPU sharing is weighted fair queueing over epochs: each tenant's
//! progress is zero when an epoch starts and grows as it consumes cycles,
//! scaled by `max_weight / weight`; the worker always runs the
//! least-progress tenant that has work. This is deliberately not strict
//! start-time fair queueing — SFQ is memoryless, and many apps keep
//! shallow queues, so a momentarily idle tenant would permanently lose
//! its share.

use crate::rate::RateLimiter;
use crate::resrc::{ResrcAcct, ResrcAlloc, ResrcCtrlBlock};
use crate::stat::LatencyStat;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tenfs_buffer::CacheClient;
use tenfs_cache::{AccessMode, GhostCurve, SampledGhostCache, Tag};
use tenfs_types::params::{
    self, CYCLES_PER_SECOND, MIN_CACHE, MIN_WEIGHT, cycles_to_progress, cycles_to_weight,
    progress_to_cycles,
};
use tenfs_types::{AppId, BlockNo, Policy, WorkerId};
use tracing::{debug, info};

/// Cross-thread view of one tenant handed to the allocator: everything it
/// may read (atomically) or poke (rate limiter) without touching
/// worker-owned state.
#[derive(Debug, Clone)]
pub struct TenantStatHandle {
    pub wid: WorkerId,
    pub aid: AppId,
    pub acct: Arc<ResrcAcct>,
    pub curve: Arc<GhostCurve>,
    pub limiter: Arc<RateLimiter>,
    pub init_resrc: ResrcAlloc,
    /// This tenant's currently applied cache size in blocks; tracks every
    /// `set_resrc`, unlike the one-time `init_resrc` snapshot.
    pub cache_size: Arc<AtomicU32>,
    pub num_inodes: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct Tenant<R, B> {
    wid: WorkerId,
    aid: AppId,
    /// Requests arriving from the client channel.
    recv_queue: VecDeque<R>,
    /// Requests waiting for further processing (e.g. resumed after I/O).
    intl_queue: VecDeque<R>,
    /// Block requests waiting for a rate-limit permit, paired with the
    /// filesystem request that produced them.
    blk_queue: VecDeque<(B, R)>,
    /// Virtual time within the current CPU epoch.
    cpu_prog: u64,
    resrc_acct: Arc<ResrcAcct>,
    ctrl: ResrcCtrlBlock,
    weight: u32,
    policy: Policy,
    /// Requests between recv-queue pop and final reply. Migration may only
    /// start at zero.
    num_reqs_inflight: i64,
    is_drain: bool,
    pending_inode_move: Vec<(WorkerId, usize)>,
    /// Applied cache size published for the allocator's per-worker rows.
    curr_cache_size: Arc<AtomicU32>,
    /// Inode count published for the allocator's file-placement math.
    num_inodes: Arc<AtomicUsize>,
    block_latency: LatencyStat,
}

impl<R, B> Tenant<R, B> {
    #[must_use]
    pub fn new(wid: WorkerId, aid: AppId, resrc: ResrcAlloc, policy: Policy) -> Self {
        Self::with_ghost(
            wid,
            aid,
            resrc,
            policy,
            SampledGhostCache::new(
                params::ghost::TICK,
                params::ghost::MIN_SIZE,
                params::ghost::MAX_SIZE,
            ),
        )
    }

    #[must_use]
    pub fn with_ghost(
        wid: WorkerId,
        aid: AppId,
        resrc: ResrcAlloc,
        policy: Policy,
        ghost_cache: SampledGhostCache,
    ) -> Self {
        Self {
            wid,
            aid,
            recv_queue: VecDeque::new(),
            intl_queue: VecDeque::new(),
            blk_queue: VecDeque::new(),
            cpu_prog: 0,
            resrc_acct: Arc::new(ResrcAcct::default()),
            ctrl: ResrcCtrlBlock::new(resrc, ghost_cache),
            weight: cycles_to_weight(resrc.cpu_cycles as u64).max(MIN_WEIGHT),
            policy,
            num_reqs_inflight: 0,
            is_drain: false,
            pending_inode_move: Vec::new(),
            curr_cache_size: Arc::new(AtomicU32::new(resrc.cache_size)),
            num_inodes: Arc::new(AtomicUsize::new(0)),
            block_latency: LatencyStat::named(format!("{wid}-{aid} BIO")),
        }
    }

    #[must_use]
    pub fn wid(&self) -> WorkerId {
        self.wid
    }

    #[must_use]
    pub fn aid(&self) -> AppId {
        self.aid
    }

    /// Everything the allocator may touch, as shared handles.
    #[must_use]
    pub fn stat_handle(&self) -> TenantStatHandle {
        TenantStatHandle {
            wid: self.wid,
            aid: self.aid,
            acct: Arc::clone(&self.resrc_acct),
            curve: self.ctrl.ghost_cache.curve(),
            limiter: Arc::clone(&self.ctrl.blk_rate_limiter),
            init_resrc: self.ctrl.curr_resrc,
            cache_size: Arc::clone(&self.curr_cache_size),
            num_inodes: Arc::clone(&self.num_inodes),
        }
    }

    // ── Progress and admission ─────────────────────────────────────────

    #[must_use]
    pub fn cpu_prog(&self) -> u64 {
        self.cpu_prog
    }

    /// Called by the worker at every epoch boundary.
    pub fn reset_cpu_prog(&mut self) {
        self.cpu_prog = 0;
    }

    /// Whether this tenant can be scheduled, given cycles elapsed since
    /// the current epoch began.
    #[must_use]
    pub fn can_sched(&self, elapsed_cycles: u64) -> bool {
        if self.policy.strict_cpu_usage {
            let consumed = progress_to_cycles(self.cpu_prog, self.weight);
            // `elapsed` is wall-clock, not worker-available time, so the
            // share is taken out of the full second.
            let limit = elapsed_cycles * u64::from(self.weight)
                / u64::from(cycles_to_weight(CYCLES_PER_SECOND));
            if consumed > limit {
                return false;
            }
        }
        !((self.recv_queue.is_empty() || self.is_drain) && self.intl_queue.is_empty())
    }

    // ── Queues ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn recv_qlen(&self) -> usize {
        self.recv_queue.len()
    }

    #[must_use]
    pub fn intl_qlen(&self) -> usize {
        self.intl_queue.len()
    }

    #[must_use]
    pub fn blk_qlen(&self) -> usize {
        self.blk_queue.len()
    }

    pub fn add_recv_queue(&mut self, req: R) {
        self.recv_queue.push_back(req);
    }

    pub fn add_intl_queue(&mut self, req: R) {
        self.intl_queue.push_back(req);
    }

    pub fn add_blk_queue(&mut self, blk_req: B, req: R) {
        self.blk_queue.push_back((blk_req, req));
    }

    /// Pop a fresh client request; refuses while draining. Popping opens
    /// the in-flight window closed by [`Tenant::record_req_done`].
    pub fn pop_recv_queue(&mut self) -> Option<R> {
        if self.is_drain {
            return None;
        }
        let req = self.recv_queue.pop_front()?;
        self.num_reqs_inflight += 1;
        Some(req)
    }

    pub fn pop_intl_queue(&mut self) -> Option<R> {
        self.intl_queue.pop_front()
    }

    /// Pop a block request if the rate limiter permits. The popped block
    /// is accounted as submitted immediately.
    ///
    /// `cache_unpopulated` is whether this tenant's cache partition still
    /// has free slots; under the unpopulated-cache policy the limiter is
    /// bypassed then, since the unpopulated space bounds the extra
    /// bandwidth.
    pub fn pop_blk_queue(&mut self, now_cycles: u64, cache_unpopulated: bool) -> Option<(B, R)> {
        if self.blk_queue.is_empty() {
            return None;
        }
        let skip_limiter = self.policy.cache_partition
            && self.policy.unlimited_bandwidth_if_unpopulated_cache
            && cache_unpopulated;
        if !skip_limiter && !self.ctrl.blk_rate_limiter.can_send(now_cycles) {
            return None;
        }
        let pair = self.blk_queue.pop_front()?;
        self.record_bw_consump(1);
        Some(pair)
    }

    // ── Accounting ─────────────────────────────────────────────────────

    pub fn record_blocks_done(&self, blocks: u32) {
        self.resrc_acct.add_blocks_done(blocks);
    }

    pub fn record_cpu_consump(&mut self, cycles: u64) {
        self.resrc_acct.add_cpu_consump(cycles);
        self.cpu_prog += cycles_to_progress(cycles, self.weight);
    }

    pub fn record_bw_consump(&self, blocks: u32) {
        self.resrc_acct.add_bw_consump(blocks);
    }

    pub fn record_req_done(&mut self) {
        self.num_reqs_inflight -= 1;
        debug_assert!(self.num_reqs_inflight >= 0, "in-flight count underflow");
    }

    #[must_use]
    pub fn num_reqs_inflight(&self) -> i64 {
        self.num_reqs_inflight
    }

    pub fn ghost_access_page(&mut self, page_id: u64, is_write: bool) {
        let mode = if is_write {
            AccessMode::AsMiss
        } else {
            AccessMode::Default
        };
        self.ctrl.ghost_cache.access(page_id, mode);
    }

    pub fn add_latency(&mut self, cycles: u64) {
        self.block_latency.add_latency(cycles);
    }

    #[must_use]
    pub fn cpu_per_block(&self) -> u64 {
        let snap = self.resrc_acct.snapshot();
        if snap.num_blks_done == 0 {
            return 0;
        }
        (snap.cpu_consump / snap.num_blks_done) as u64
    }

    // ── Resources ──────────────────────────────────────────────────────

    #[must_use]
    pub fn get_resrc(&self) -> ResrcAlloc {
        self.ctrl.curr_resrc
    }

    /// Apply a new allocation: recompute the weight, retune the rate
    /// limiter, and replace the current resources.
    pub fn set_resrc(&mut self, new_resrc: ResrcAlloc) {
        self.weight = cycles_to_weight(new_resrc.cpu_cycles as u64).max(MIN_WEIGHT);
        self.ctrl.blk_rate_limiter.update_bandwidth(new_resrc.bandwidth);
        self.ctrl.curr_resrc = new_resrc;
        self.curr_cache_size
            .store(new_resrc.cache_size, Ordering::Release);
        info!(
            event = "tenant_apply_resrc",
            wid = %self.wid,
            aid = %self.aid,
            cache = new_resrc.cache_size,
            bw = new_resrc.bandwidth,
            cpu = new_resrc.cpu_cycles
        );
    }

    /// Cache partition size this tenant is entitled to, floored so it can
    /// always make progress.
    #[must_use]
    pub fn max_cache_size(&self) -> u32 {
        self.ctrl.curr_resrc.cache_size.max(MIN_CACHE)
    }

    /// Scheduling weight (CPU only), floored at `MIN_WEIGHT`.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// The real allocated weight, as the allocator computes it.
    #[must_use]
    pub fn allocated_weight(&self) -> u32 {
        cycles_to_weight(self.ctrl.curr_resrc.cpu_cycles as u64)
    }

    pub fn turn_blk_rate_limiter(&self, to_on: bool) {
        self.ctrl.blk_rate_limiter.turn(to_on);
    }

    pub fn set_num_inodes(&self, n: usize) {
        self.num_inodes.store(n, Ordering::Release);
    }

    #[must_use]
    pub fn num_inodes(&self) -> usize {
        self.num_inodes.load(Ordering::Acquire)
    }

    // ── Drain / migration ──────────────────────────────────────────────

    /// Start draining ahead of inode migration. Load balancing must first
    /// reach zero in-flight so no exported block is pinned.
    pub fn set_drain_for_migration(&mut self, inode_move: Vec<(WorkerId, usize)>) {
        assert!(
            !self.is_drain && self.pending_inode_move.is_empty(),
            "previous drain still in progress"
        );
        self.is_drain = true;
        self.pending_inode_move = inode_move;
    }

    #[must_use]
    pub fn is_drain(&self) -> bool {
        self.is_drain
    }

    #[must_use]
    pub fn should_migrate(&self) -> bool {
        self.is_drain && self.num_reqs_inflight == 0
    }

    #[must_use]
    pub fn pending_inode_move(&self) -> &[(WorkerId, usize)] {
        assert!(self.is_drain);
        &self.pending_inode_move
    }

    pub fn unset_drain_for_migration(&mut self) {
        self.is_drain = false;
        self.pending_inode_move.clear();
    }
}

impl<R, B> Drop for Tenant<R, B> {
    fn drop(&mut self) {
        let snap = self.resrc_acct.snapshot();
        debug!(
            event = "tenant_report",
            wid = %self.wid,
            aid = %self.aid,
            total_read_mb = params::blocks_to_mb(snap.num_blks_done.max(0) as u64),
            total_io_mb = params::blocks_to_mb(snap.bw_consump.max(0) as u64),
            total_cpu_cycles = snap.cpu_consump,
            cache_mb = params::blocks_to_mb(u64::from(self.ctrl.curr_resrc.cache_size)),
            bw_mbps = params::blocks_to_mb(self.ctrl.curr_resrc.bandwidth.max(0) as u64),
            cycles_per_block = self.cpu_per_block()
        );
    }
}

impl<R, B> CacheClient for Tenant<R, B> {
    fn tag(&self) -> Tag {
        Tag::Tenant(self.aid)
    }

    fn ghost_access(&mut self, block: BlockNo, is_write: bool) {
        self.ghost_access_page(block.0, is_write);
    }

    fn note_blocks_done(&self, blocks: u32) {
        self.record_blocks_done(blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenfs_types::params::{CYCLES_PER_CPU_EPOCH, MAX_WEIGHT, weight_to_cycles};

    type TestTenant = Tenant<u32, u64>;

    fn tenant_with_weight(weight: u32) -> TestTenant {
        let resrc = ResrcAlloc {
            cache_size: 1024,
            bandwidth: 1024,
            cpu_cycles: weight_to_cycles(weight) as i64,
        };
        Tenant::with_ghost(
            WorkerId(0),
            AppId(0),
            resrc,
            Policy::default(),
            SampledGhostCache::with_sample_shift(8, 8, 64, 0),
        )
    }

    #[test]
    fn queue_fifo_order() {
        let mut t = tenant_with_weight(100);
        for req in [1, 2, 3] {
            t.add_recv_queue(req);
        }
        assert_eq!(t.pop_recv_queue(), Some(1));
        assert_eq!(t.pop_recv_queue(), Some(2));
        assert_eq!(t.pop_recv_queue(), Some(3));
        assert_eq!(t.num_reqs_inflight(), 3);
    }

    #[test]
    fn drain_blocks_recv_but_not_intl() {
        let mut t = tenant_with_weight(100);
        t.add_recv_queue(1);
        t.add_intl_queue(2);
        t.set_drain_for_migration(vec![(WorkerId(1), 2)]);
        assert_eq!(t.pop_recv_queue(), None);
        assert_eq!(t.pop_intl_queue(), Some(2));
    }

    #[test]
    fn should_migrate_waits_for_inflight() {
        let mut t = tenant_with_weight(100);
        t.add_recv_queue(1);
        t.add_recv_queue(2);
        let _ = t.pop_recv_queue();
        let _ = t.pop_recv_queue();
        // Wait: drain starts after the pops here, so recv popping was allowed.
        t.set_drain_for_migration(vec![(WorkerId(1), 2)]);
        assert!(!t.should_migrate());
        t.record_req_done();
        assert!(!t.should_migrate());
        t.record_req_done();
        assert!(t.should_migrate());
        assert_eq!(t.pending_inode_move(), &[(WorkerId(1), 2)]);
        t.unset_drain_for_migration();
        assert!(!t.is_drain());
        assert_eq!(t.num_reqs_inflight(), 0);
    }

    /// A tenant holding 10 % of the weight that has burned 15 % of the
    /// window's cycles is throttled until the epoch resets, queue depth
    /// notwithstanding.
    #[test]
    fn strict_cpu_throttle() {
        // 10% of a full wall-clock second's weight.
        let weight = cycles_to_weight(CYCLES_PER_SECOND) / 10;
        let mut t = tenant_with_weight(weight);
        t.add_recv_queue(1);

        let window = CYCLES_PER_CPU_EPOCH;
        assert!(t.can_sched(window));

        // Consume 15% of the window's cycles.
        t.record_cpu_consump(window * 15 / 100);
        assert!(!t.can_sched(window));

        // A new epoch clears the throttle.
        t.reset_cpu_prog();
        assert!(t.can_sched(window));
    }

    #[test]
    fn progress_scales_with_weight() {
        let mut heavy = tenant_with_weight(MAX_WEIGHT);
        let mut light = tenant_with_weight(MAX_WEIGHT / 8);
        heavy.record_cpu_consump(1_000_000);
        light.record_cpu_consump(1_000_000);
        assert_eq!(heavy.cpu_prog() * 8, light.cpu_prog());
    }

    #[test]
    fn blk_queue_respects_rate_limiter() {
        let mut t = tenant_with_weight(100);
        for i in 0..4_u64 {
            t.add_blk_queue(i, 0);
        }
        // Frame offset 0 admits exactly one block.
        assert!(t.pop_blk_queue(0, false).is_some());
        assert!(t.pop_blk_queue(0, false).is_none());
        // Unpopulated cache bypasses the limiter entirely.
        assert!(t.pop_blk_queue(0, true).is_some());
        assert!(t.pop_blk_queue(0, true).is_some());
        let snap = t.resrc_acct.snapshot();
        assert_eq!(snap.bw_consump, 3);
    }

    #[test]
    fn min_weight_floor() {
        let t = tenant_with_weight(0);
        assert_eq!(t.weight(), MIN_WEIGHT);
    }

    #[test]
    fn stat_handle_sees_applied_cache_size() {
        let mut t = tenant_with_weight(100);
        let handle = t.stat_handle();
        assert_eq!(handle.cache_size.load(Ordering::Acquire), 1024);

        t.set_resrc(ResrcAlloc {
            cache_size: 2048,
            bandwidth: 512,
            cpu_cycles: weight_to_cycles(100) as i64,
        });
        // The handle is live, not a snapshot of the registration-time
        // allocation.
        assert_eq!(handle.cache_size.load(Ordering::Acquire), 2048);
        assert_eq!(handle.init_resrc.cache_size, 1024);
    }
}
