//! Cooperative worker loop.
//!
//! Each worker is one thread owning its tenants, its block buffer
//! partition, its device submission path, and its control-message
//! receiver. One loop iteration:
//!
//! 1. poll device completions and resume the requests they unblock;
//! 2. ingest client requests; reset the CPU epoch when it expires;
//! 3. pick the least-progress schedulable tenant and process a bounded
//!    batch of its requests;
//! 4. drain block queues until the rate limiters deny;
//! 5. service the flusher (one background batch, waiting foreground
//!    fsyncs);
//! 6. apply allocator messages and incoming migrations;
//! 7. export inodes for any tenant that finished draining.
//!
//! The loop never blocks and never yields mid-iteration; allocator
//! decisions become effective between iterations, atomically from the
//! tenants' point of view.

use crate::client::ClientChannel;
use crate::dev::{BlockDev, DevCompletion, DevReq, DevReqKind};
use crate::msg::{CtrlMsg, InodeMeta, Messenger};
use crate::req::{BlockReq, FsOp, FsReply, FsReq, FsResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;
use tenfs_buffer::BlockBuffer;
use tenfs_cache::{SlotHandle, Tag};
use tenfs_sched::{CycleClock, IdleStat, Tenant};
use tenfs_types::params::{CYCLES_PER_CPU_EPOCH, NUM_REQS_PER_LOOP};
use tenfs_types::{AppId, BlockNo, BlockReqId, InodeNo, Policy, WorkerId};
use tracing::{debug, error, info, warn};

type WorkerTenant = Tenant<FsReq, BlockReq>;

/// Why a device request is in flight, for routing its completion.
#[derive(Debug)]
enum PendingIo {
    /// A tenant read; the slot stays pinned until the data lands.
    TenantRead { aid: AppId, handle: SlotHandle, req: FsReq },
    FgFlushWrite { handle: SlotHandle, ino: InodeNo },
    BgFlushWrite { handle: SlotHandle },
}

/// One inode's foreground flush in flight: the fsync requests it will
/// answer and the writes still outstanding.
#[derive(Debug)]
struct FgFlushState {
    reqs: Vec<FsReq>,
    remaining: usize,
}

pub struct Worker {
    wid: WorkerId,
    policy: Policy,
    /// Ordered by app id: the deterministic tie-break for scheduling.
    tenants: BTreeMap<AppId, WorkerTenant>,
    buffer: BlockBuffer,
    dev: Arc<dyn BlockDev>,
    ctrl_rx: Receiver<CtrlMsg>,
    messenger: Messenger,
    clients: HashMap<AppId, Box<dyn ClientChannel>>,
    /// Inodes currently placed on this worker, per app.
    inodes: HashMap<AppId, BTreeMap<InodeNo, InodeMeta>>,
    clock: CycleClock,
    epoch_start_cycles: u64,
    next_req_id: u64,
    pending_io: HashMap<BlockReqId, PendingIo>,
    fg_flush: HashMap<InodeNo, FgFlushState>,
    /// Fsyncs waiting for a flush window, keyed by inode.
    parked_fsyncs: HashMap<InodeNo, Vec<FsReq>>,
    bg_flush_remaining: usize,
    /// Migrations sent and awaiting acknowledgment, per app.
    awaiting_move_acks: HashMap<AppId, usize>,
    idle_stat: IdleStat,
}

impl Worker {
    #[must_use]
    pub fn new(
        wid: WorkerId,
        policy: Policy,
        buffer: BlockBuffer,
        dev: Arc<dyn BlockDev>,
        ctrl_rx: Receiver<CtrlMsg>,
        messenger: Messenger,
    ) -> Self {
        Self {
            wid,
            policy,
            tenants: BTreeMap::new(),
            buffer,
            dev,
            ctrl_rx,
            messenger,
            clients: HashMap::new(),
            inodes: HashMap::new(),
            clock: CycleClock::new(),
            epoch_start_cycles: 0,
            next_req_id: 0,
            pending_io: HashMap::new(),
            fg_flush: HashMap::new(),
            parked_fsyncs: HashMap::new(),
            bg_flush_remaining: 0,
            awaiting_move_acks: HashMap::new(),
            idle_stat: IdleStat::new(wid.0),
        }
    }

    #[must_use]
    pub fn wid(&self) -> WorkerId {
        self.wid
    }

    /// Attach an app: its tenant, its client channel, and its initial
    /// inode placement.
    pub fn attach_app(
        &mut self,
        tenant: WorkerTenant,
        channel: Box<dyn ClientChannel>,
        inodes: Vec<(InodeNo, InodeMeta)>,
    ) {
        let aid = tenant.aid();
        tenant.set_num_inodes(inodes.len());
        self.inodes.insert(aid, inodes.into_iter().collect());
        self.clients.insert(aid, channel);
        self.tenants.insert(aid, tenant);
    }

    #[must_use]
    pub fn tenant(&self, aid: AppId) -> Option<&WorkerTenant> {
        self.tenants.get(&aid)
    }

    #[must_use]
    pub fn buffer(&self) -> &BlockBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut BlockBuffer {
        &mut self.buffer
    }

    #[must_use]
    pub fn num_inodes(&self, aid: AppId) -> usize {
        self.inodes.get(&aid).map_or(0, BTreeMap::len)
    }

    fn alloc_req_id(&mut self) -> BlockReqId {
        self.next_req_id += 1;
        BlockReqId(self.next_req_id)
    }

    /// One full loop iteration.
    pub fn run_loop_inner(&mut self) {
        let now = self.clock.now_cycles();
        self.poll_device();
        self.ingest_clients();

        if now.saturating_sub(self.epoch_start_cycles) >= CYCLES_PER_CPU_EPOCH {
            for tenant in self.tenants.values_mut() {
                tenant.reset_cpu_prog();
            }
            self.epoch_start_cycles = now;
        }
        let elapsed = now - self.epoch_start_cycles;

        if let Some(aid) = self.pick_tenant(elapsed) {
            self.process_tenant_batch(aid);
        } else {
            self.idle_stat.start(now);
            self.idle_stat.stop(self.clock.now_cycles());
        }

        self.drain_blk_queues(now);
        self.service_flusher();
        self.poll_ctrl_messages();
        self.run_migrations();
    }

    // ── Step 1: device completions ─────────────────────────────────────

    fn poll_device(&mut self) {
        for completion in self.dev.poll_completions(usize::MAX) {
            self.handle_completion(completion);
        }
    }

    fn handle_completion(&mut self, completion: DevCompletion) {
        let Some(pending) = self.pending_io.remove(&completion.id) else {
            error!(event = "unknown_completion", id = %completion.id, wid = %self.wid);
            panic!("completion for unknown request {}", completion.id);
        };
        match pending {
            PendingIo::TenantRead { aid, handle, req } => {
                let data = completion.data.expect("read completion carries data");
                let slot = self.buffer.slot_mut(handle);
                slot.data_mut().as_mut_slice().copy_from_slice(&data);
                slot.set_io_done();
                // Drop the I/O pin; the resumed request re-pins on its
                // next lookup.
                self.buffer.release_block(handle);
                if let Some(tenant) = self.tenants.get_mut(&aid) {
                    tenant.add_intl_queue(req);
                } else {
                    warn!(event = "completion_for_detached_app", aid = %aid);
                }
            }
            PendingIo::FgFlushWrite { handle, ino } => {
                self.buffer.unset_block_dirty(handle);
                let finished = {
                    let state = self
                        .fg_flush
                        .get_mut(&ino)
                        .expect("foreground flush state exists while writes are in flight");
                    state.remaining -= 1;
                    state.remaining == 0
                };
                if finished {
                    let state = self.fg_flush.remove(&ino).expect("checked above");
                    self.buffer.flusher.add_fg_flush_inflight_num(-1);
                    for req in state.reqs {
                        self.finish_request(req, FsResult::Done);
                    }
                }
            }
            PendingIo::BgFlushWrite { handle } => {
                self.buffer.unset_block_dirty(handle);
                self.bg_flush_remaining -= 1;
                if self.bg_flush_remaining == 0 {
                    self.buffer
                        .flusher
                        .do_flush_done()
                        .expect("background batch was in flight");
                }
            }
        }
    }

    // ── Step 2: client ingest ──────────────────────────────────────────

    fn ingest_clients(&mut self) {
        for (aid, channel) in &self.clients {
            let tenant = self
                .tenants
                .get_mut(aid)
                .expect("every client channel has a tenant");
            while let Some(req) = channel.poll_request() {
                tenant.add_recv_queue(req);
            }
        }
    }

    // ── Step 3: tenant pick and request batch ──────────────────────────

    fn pick_tenant(&self, elapsed: u64) -> Option<AppId> {
        self.tenants
            .iter()
            .filter(|(_, t)| t.can_sched(elapsed))
            .min_by_key(|(aid, t)| (t.cpu_prog(), **aid))
            .map(|(aid, _)| *aid)
    }

    fn process_tenant_batch(&mut self, aid: AppId) {
        for _ in 0..NUM_REQS_PER_LOOP {
            let started = self.clock.now_cycles();
            let req = {
                let tenant = self.tenants.get_mut(&aid).expect("picked tenant exists");
                tenant.pop_intl_queue().or_else(|| tenant.pop_recv_queue())
            };
            let Some(req) = req else {
                break;
            };
            self.process_request(aid, req);
            let spent = self.clock.now_cycles().saturating_sub(started).max(1);
            if let Some(tenant) = self.tenants.get_mut(&aid) {
                tenant.record_cpu_consump(spent);
                tenant.add_latency(spent);
            }
        }
    }

    fn process_request(&mut self, aid: AppId, req: FsReq) {
        match req.op.clone() {
            FsOp::Read { block } => self.process_read(aid, req, block),
            FsOp::Write { block, data } => self.process_write(aid, req, block, data),
            FsOp::Fsync => self.process_fsync(aid, req),
        }
    }

    fn process_read(&mut self, aid: AppId, req: FsReq, block: BlockNo) {
        let ino = req.ino;
        let tenant = self.tenants.get_mut(&aid).expect("picked tenant exists");
        let Some(handle) = self.buffer.get_block(block, ino, Some(tenant), false) else {
            // Partition full and fully pinned: back off to the internal
            // queue tail and retry after the flusher makes room.
            debug!(event = "cache_full_backoff", aid = %aid, block = block.0);
            self.tenants
                .get_mut(&aid)
                .expect("picked tenant exists")
                .add_intl_queue(req);
            return;
        };

        let slot = self.buffer.slot(handle);
        if slot.is_in_mem() {
            let data = slot.data().as_slice().to_vec();
            self.buffer.release_block(handle);
            self.finish_request(req, FsResult::Data(data));
        } else if slot.pending_req().is_some() {
            // Another request already has the read in flight; retry once
            // it lands. The extra pin from this lookup is dropped.
            self.buffer.release_block(handle);
            self.tenants
                .get_mut(&aid)
                .expect("picked tenant exists")
                .add_intl_queue(req);
        } else {
            let id = self.alloc_req_id();
            self.buffer.slot_mut(handle).set_io_submitted(id);
            let blk_req = BlockReq {
                id,
                block_no: block,
                handle,
            };
            self.tenants
                .get_mut(&aid)
                .expect("picked tenant exists")
                .add_blk_queue(blk_req, req);
        }
    }

    fn process_write(&mut self, aid: AppId, req: FsReq, block: BlockNo, data: Vec<u8>) {
        let ino = req.ino;
        // First write to an inode places it on this worker.
        let app_inodes = self.inodes.entry(aid).or_default();
        if !ino.is_none() && !app_inodes.contains_key(&ino) {
            app_inodes.insert(ino, InodeMeta { file_size: 0 });
            if let Some(tenant) = self.tenants.get(&aid) {
                tenant.set_num_inodes(app_inodes.len());
            }
        }
        let tenant = self.tenants.get_mut(&aid).expect("picked tenant exists");
        let Some(handle) = self.buffer.get_block(block, ino, Some(tenant), true) else {
            debug!(event = "cache_full_backoff", aid = %aid, block = block.0);
            self.tenants
                .get_mut(&aid)
                .expect("picked tenant exists")
                .add_intl_queue(req);
            return;
        };

        {
            let slot = self.buffer.slot_mut(handle);
            slot.data_mut().as_mut_slice().copy_from_slice(&data);
            if !slot.is_in_mem() {
                // A full-block write needs no device read.
                slot.set_io_done();
            }
        }
        self.buffer.set_block_dirty(handle, ino);
        self.buffer.release_block(handle);
        self.finish_request(req, FsResult::Done);
    }

    fn process_fsync(&mut self, _aid: AppId, req: FsReq) {
        let ino = req.ino;
        if self.fg_flush.contains_key(&ino) {
            // A flush of this inode is already in flight; this fsync must
            // cover blocks dirtied since, so it waits for its own window.
            self.buffer.flusher.add_fg_flush_wait_index(ino);
            self.parked_fsyncs.entry(ino).or_default().push(req);
            return;
        }
        let batch = self.buffer.flusher.do_flush_by_index(ino);
        if !batch.can_flush {
            self.buffer.flusher.add_fg_flush_wait_index(ino);
            self.parked_fsyncs.entry(ino).or_default().push(req);
            return;
        }
        self.submit_fg_flush(ino, vec![req], batch.handles);
    }

    fn submit_fg_flush(&mut self, ino: InodeNo, reqs: Vec<FsReq>, handles: Vec<SlotHandle>) {
        if handles.is_empty() {
            // Newly created file with nothing dirtied yet.
            for req in reqs {
                self.finish_request(req, FsResult::Done);
            }
            return;
        }
        self.buffer.flusher.add_fg_flush_inflight_num(1);
        let remaining = handles.len();
        for handle in &handles {
            let id = self.alloc_req_id();
            let data = self.buffer.slot(*handle).data().as_slice().to_vec();
            let block_no = self.buffer.block_no_of(*handle);
            self.pending_io
                .insert(id, PendingIo::FgFlushWrite { handle: *handle, ino });
            self.submit_to_dev(DevReq {
                id,
                block_no,
                kind: DevReqKind::Write,
                data: Some(data),
            });
        }
        self.fg_flush.insert(ino, FgFlushState { reqs, remaining });
    }

    // ── Step 4: rate-limited block submission ──────────────────────────

    fn drain_blk_queues(&mut self, now: u64) {
        let aids: Vec<AppId> = self.tenants.keys().copied().collect();
        for aid in aids {
            loop {
                let unpopulated = {
                    let tag = Tag::Tenant(aid);
                    self.buffer.cache().size_of(tag) < self.buffer.cache().capacity_of(tag)
                };
                let tenant = self.tenants.get_mut(&aid).expect("listed tenant exists");
                let Some((blk_req, fs_req)) = tenant.pop_blk_queue(now, unpopulated) else {
                    break;
                };
                match self.dev.submit(DevReq {
                    id: blk_req.id,
                    block_no: blk_req.block_no,
                    kind: DevReqKind::Read,
                    data: None,
                }) {
                    Ok(()) => {
                        self.pending_io.insert(
                            blk_req.id,
                            PendingIo::TenantRead {
                                aid,
                                handle: blk_req.handle,
                                req: fs_req,
                            },
                        );
                    }
                    Err(err) => {
                        // Not fatal: undo the slot's submitted state, drop
                        // the I/O pin, and back off to the internal queue.
                        error!(event = "dev_submit_failed", wid = %self.wid, %err);
                        self.buffer.slot_mut(blk_req.handle).reset();
                        self.buffer.release_block(blk_req.handle);
                        self.tenants
                            .get_mut(&aid)
                            .expect("listed tenant exists")
                            .add_intl_queue(fs_req);
                    }
                }
            }
        }
    }

    fn submit_to_dev(&mut self, req: DevReq) {
        if let Err(err) = self.dev.submit(req) {
            // Flush writes are always well-formed; a failure here is a
            // device-layer bug worth surfacing loudly.
            error!(event = "dev_submit_failed", wid = %self.wid, %err);
        }
    }

    // ── Step 5: flusher service ────────────────────────────────────────

    fn service_flusher(&mut self) {
        if self.buffer.flusher.check_if_need_bg_flush() {
            let batch = self.buffer.flusher.do_flush();
            if batch.can_flush && !batch.handles.is_empty() {
                self.bg_flush_remaining = batch.handles.len();
                for handle in batch.handles {
                    let id = self.alloc_req_id();
                    let data = self.buffer.slot(handle).data().as_slice().to_vec();
                    let block_no = self.buffer.block_no_of(handle);
                    self.pending_io.insert(id, PendingIo::BgFlushWrite { handle });
                    self.submit_to_dev(DevReq {
                        id,
                        block_no,
                        kind: DevReqKind::Write,
                        data: Some(data),
                    });
                }
            }
        }

        // Retry parked foreground fsyncs whose window may have opened.
        for ino in self.buffer.flusher.fg_wait_indices() {
            if self.buffer.flusher.check_if_fg_flush_reach_limit() {
                break;
            }
            if self.fg_flush.contains_key(&ino) {
                continue; // this inode's previous flush is still in flight
            }
            if !self.parked_fsyncs.contains_key(&ino) {
                warn!(event = "fg_wait_without_request", index = %ino);
                self.buffer.flusher.remove_fg_flush_wait_index(ino);
                continue;
            }
            let batch = self.buffer.flusher.do_flush_by_index(ino);
            if batch.can_flush {
                self.buffer.flusher.remove_fg_flush_wait_index(ino);
                let reqs = self.parked_fsyncs.remove(&ino).expect("checked above");
                self.submit_fg_flush(ino, reqs, batch.handles);
            }
        }
    }

    // ── Step 6: control messages ───────────────────────────────────────

    fn poll_ctrl_messages(&mut self) {
        while let Ok(msg) = self.ctrl_rx.try_recv() {
            match msg {
                CtrlMsg::NewResrcAlloc(decision) => self.apply_decision(decision),
                CtrlMsg::InodeMove {
                    aid,
                    index,
                    meta,
                    slots,
                    src_wid,
                } => {
                    debug!(
                        event = "inode_move_recv",
                        wid = %self.wid,
                        aid = %aid,
                        index = %index,
                        num_slots = slots.len()
                    );
                    self.buffer.install_buffer_items_of_index(index, slots);
                    self.inodes.entry(aid).or_default().insert(index, meta);
                    if let Some(tenant) = self.tenants.get(&aid) {
                        tenant.set_num_inodes(self.inodes[&aid].len());
                    }
                    self.messenger
                        .send(src_wid, CtrlMsg::InodeMoveAck { aid, index });
                }
                CtrlMsg::InodeMoveAck { aid, index } => {
                    debug!(event = "inode_move_ack", wid = %self.wid, aid = %aid, index = %index);
                    let remaining = self
                        .awaiting_move_acks
                        .get_mut(&aid)
                        .expect("ack only arrives for a pending migration");
                    *remaining -= 1;
                    if *remaining == 0 {
                        let _ = self.awaiting_move_acks.remove(&aid);
                        if let Some(tenant) = self.tenants.get_mut(&aid) {
                            tenant.unset_drain_for_migration();
                        }
                    }
                }
            }
        }
    }

    fn apply_decision(&mut self, decision: tenfs_sched::AllocDecision) {
        let aid = decision.aid;
        let Some(tenant) = self.tenants.get_mut(&aid) else {
            error!(event = "decision_for_unknown_app", wid = %self.wid, aid = %aid);
            panic!("allocation decision for unknown app {aid}");
        };
        tenant.set_resrc(decision.resrc);
        if self.policy.cache_partition {
            let new_size = tenant.max_cache_size() as usize;
            self.buffer.adjust_cache_size(Tag::Tenant(aid), new_size);
        }
        if !decision.inode_move.is_empty() {
            info!(
                event = "drain_for_migration",
                wid = %self.wid,
                aid = %aid,
                moves = decision.inode_move.len()
            );
            self.tenants
                .get_mut(&aid)
                .expect("checked above")
                .set_drain_for_migration(decision.inode_move);
        }
    }

    // ── Step 7: outbound migration ─────────────────────────────────────

    fn run_migrations(&mut self) {
        let ready: Vec<AppId> = self
            .tenants
            .iter()
            .filter(|(aid, t)| t.should_migrate() && !self.awaiting_move_acks.contains_key(aid))
            .map(|(aid, _)| *aid)
            .collect();
        for aid in ready {
            let plan = self.tenants[&aid].pending_inode_move().to_vec();
            let mut sent = 0_usize;
            for (dst_wid, nfiles) in plan {
                for _ in 0..nfiles {
                    let Some((&index, &meta)) = self
                        .inodes
                        .get(&aid)
                        .and_then(|map| map.iter().next())
                    else {
                        warn!(
                            event = "migration_out_of_inodes",
                            wid = %self.wid,
                            aid = %aid
                        );
                        break;
                    };
                    let slots = self
                        .buffer
                        .split_buffer_items_by_index(index)
                        .unwrap_or_default();
                    self.inodes
                        .get_mut(&aid)
                        .expect("checked above")
                        .remove(&index);
                    self.tenants[&aid].set_num_inodes(self.inodes[&aid].len());
                    debug!(
                        event = "inode_move_send",
                        wid = %self.wid,
                        aid = %aid,
                        index = %index,
                        dst = %dst_wid,
                        num_slots = slots.len()
                    );
                    self.messenger.send(
                        dst_wid,
                        CtrlMsg::InodeMove {
                            aid,
                            index,
                            meta,
                            slots,
                            src_wid: self.wid,
                        },
                    );
                    sent += 1;
                }
            }
            if sent == 0 {
                // Nothing to move (e.g. the plan was stale); finish the
                // drain immediately.
                self.tenants
                    .get_mut(&aid)
                    .expect("listed tenant exists")
                    .unset_drain_for_migration();
            } else {
                self.awaiting_move_acks.insert(aid, sent);
            }
        }
    }

    // ── Reply and shutdown paths ───────────────────────────────────────

    fn finish_request(&mut self, req: FsReq, result: FsResult) {
        let aid = req.aid;
        if let Some(tenant) = self.tenants.get_mut(&aid) {
            tenant.record_req_done();
        }
        let reply = FsReply {
            aid,
            ino: req.ino,
            result,
        };
        if let Some(channel) = self.clients.get(&aid) {
            channel.push_reply(reply);
        } else {
            warn!(event = "reply_without_channel", aid = %aid);
        }
    }

    /// Drain on shutdown: finish in-flight submissions and flush every
    /// dirty block.
    pub fn shutdown_flush(&mut self) {
        info!(event = "worker_shutdown_begin", wid = %self.wid);
        let mut guard = 0;
        while (!self.pending_io.is_empty() || self.buffer.flusher.dirty_item_num() > 0)
            && guard < 1_000_000
        {
            self.poll_device();
            let now = self.clock.now_cycles();
            self.drain_blk_queues(now);
            if self.bg_flush_remaining == 0 && self.buffer.flusher.dirty_item_num() > 0 {
                // Final flush ignores the dirty-ratio threshold.
                self.buffer
                    .flusher
                    .set_dirty_flush_one_time_submit_num(self.buffer.flusher.dirty_item_num());
                let batch = self.buffer.flusher.do_flush();
                if batch.can_flush && !batch.handles.is_empty() {
                    self.bg_flush_remaining = batch.handles.len();
                    for handle in batch.handles {
                        let id = self.alloc_req_id();
                        let data = self.buffer.slot(handle).data().as_slice().to_vec();
                        let block_no = self.buffer.block_no_of(handle);
                        self.pending_io.insert(id, PendingIo::BgFlushWrite { handle });
                        self.submit_to_dev(DevReq {
                            id,
                            block_no,
                            kind: DevReqKind::Write,
                            data: Some(data),
                        });
                    }
                }
            }
            guard += 1;
        }
        info!(event = "worker_shutdown_done", wid = %self.wid);
    }

    /// Run until `stop`, then drain and flush.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(event = "worker_started", wid = %self.wid);
        while !stop.load(Ordering::Acquire) {
            self.run_loop_inner();
        }
        self.shutdown_flush();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("wid", &self.wid)
            .field("tenants", &self.tenants.len())
            .field("pending_io", &self.pending_io.len())
            .finish_non_exhaustive()
    }
}

/// A worker running on its own named thread.
#[derive(Debug)]
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `worker` on a thread named after its id. True core pinning
    /// needs unsafe syscalls, which this workspace forbids; the thread
    /// name carries the intended core as an advisory hint.
    #[must_use]
    pub fn spawn(mut worker: Worker, core_hint: Option<usize>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let name = match core_hint {
            Some(core) => format!("worker-{}@{core}", worker.wid().0),
            None => format!("worker-{}", worker.wid().0),
        };
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(&thread_stop))
            .expect("failed to spawn worker thread");
        Self {
            stop,
            join: Some(join),
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
