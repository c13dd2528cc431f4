#![forbid(unsafe_code)]
//! Background and foreground flush discipline through a full worker.
//!
//! Scenario: with a dirty-ratio threshold of 0.2 on an 800-slot buffer,
//! the 161st dirty block trips a background flush of exactly one batch;
//! an fsync then flushes the inode's remaining dirty blocks in the
//! foreground.

use std::sync::Arc;
use tenfs_buffer::BlockBuffer;
use tenfs_cache::Tag;
use tenfs_sched::{ResrcAlloc, Tenant};
use tenfs_server::client::pair;
use tenfs_server::dev::{BlockDev, MemBlockDev};
use tenfs_server::msg::Messenger;
use tenfs_server::req::{FsReq, FsResult};
use tenfs_server::worker::Worker;
use tenfs_types::params::CYCLES_PER_SECOND;
use tenfs_types::{AppId, BLOCK_SIZE, BlockNo, InodeNo, Policy, WorkerId};

const AID: AppId = AppId(0);
const INO: InodeNo = InodeNo(9);
const POOL: usize = 800;
const THRESHOLD_BLOCKS: usize = 161; // first count with ratio > 0.2
const BATCH: usize = 100;

#[test]
fn dirty_threshold_triggers_one_background_batch() {
    // Two polls of latency so the in-flight batch is observable.
    let dev = Arc::new(MemBlockDev::with_latency(BLOCK_SIZE, 2));
    let (messenger, mut receivers) = Messenger::new(1);
    let rx = receivers.pop().unwrap();

    let tags = [(Tag::Tenant(AID), POOL), (Tag::Unalloc, 0)];
    let buffer = BlockBuffer::new_multi_tenant(&tags, BLOCK_SIZE, true, "flush-w0");
    let policy = Policy::default();
    let mut worker = Worker::new(
        WorkerId(0),
        policy,
        buffer,
        Arc::clone(&dev) as Arc<dyn BlockDev>,
        rx,
        messenger,
    );
    worker.buffer_mut().flusher.set_dirty_ratio(0.2);
    worker
        .buffer_mut()
        .flusher
        .set_dirty_flush_one_time_submit_num(BATCH);

    let resrc = ResrcAlloc {
        cache_size: POOL as u32,
        bandwidth: 1_000_000,
        cpu_cycles: CYCLES_PER_SECOND as i64,
    };
    let tenant = Tenant::new(WorkerId(0), AID, resrc, policy);
    let (client, worker_end) = pair();
    worker.attach_app(tenant, Box::new(worker_end), Vec::new());

    // One fewer than the trigger count: no background flush yet.
    for block in 0..(THRESHOLD_BLOCKS - 1) as u64 {
        client.send_request(FsReq::write(AID, INO, BlockNo(block), vec![7; BLOCK_SIZE]));
    }
    for _ in 0..((THRESHOLD_BLOCKS - 1) / 3 + 2) {
        worker.run_loop_inner();
    }
    assert_eq!(worker.buffer().flusher.dirty_item_num(), THRESHOLD_BLOCKS - 1);
    assert!(!worker.buffer().flusher.bg_flush_sent());
    assert_eq!(dev.inflight_len(), 0);

    // The 161st dirty block crosses the threshold; the next service pass
    // submits exactly one batch and marks it in flight.
    client.send_request(FsReq::write(
        AID,
        INO,
        BlockNo(THRESHOLD_BLOCKS as u64),
        vec![7; BLOCK_SIZE],
    ));
    worker.run_loop_inner();
    assert_eq!(worker.buffer().flusher.dirty_item_num(), THRESHOLD_BLOCKS);
    assert!(worker.buffer().flusher.bg_flush_sent());
    assert_eq!(dev.inflight_len(), BATCH);

    // Until the batch lands, no second background flush goes out.
    worker.run_loop_inner();
    assert_eq!(dev.inflight_len(), BATCH);

    // Batch completion clears the in-flight flag and the flushed dirt;
    // the remaining ratio is back under the threshold.
    for _ in 0..4 {
        worker.run_loop_inner();
    }
    assert!(!worker.buffer().flusher.bg_flush_sent());
    assert_eq!(
        worker.buffer().flusher.dirty_item_num(),
        THRESHOLD_BLOCKS - BATCH
    );
    assert_eq!(dev.inflight_len(), 0);

    // An fsync now flushes the inode's remaining dirty blocks in the
    // foreground and replies once they are durable.
    client.send_request(FsReq::fsync(AID, INO));
    for _ in 0..6 {
        worker.run_loop_inner();
    }
    let reply = client.poll_reply().expect("fsync must be answered");
    assert_eq!(reply.result, FsResult::Done);
    assert_eq!(worker.buffer().flusher.dirty_item_num(), 0);

    // Every dirtied block reached the device exactly once.
    let written = dev.peek(BlockNo(0)).expect("block 0 was flushed");
    assert_eq!(written, vec![7; BLOCK_SIZE]);
}

#[test]
fn fsync_of_clean_inode_replies_immediately() {
    let dev = Arc::new(MemBlockDev::new(BLOCK_SIZE));
    let (messenger, mut receivers) = Messenger::new(1);
    let rx = receivers.pop().unwrap();
    let tags = [(Tag::Tenant(AID), 64), (Tag::Unalloc, 0)];
    let buffer = BlockBuffer::new_multi_tenant(&tags, BLOCK_SIZE, true, "fsync-w0");
    let policy = Policy::default();
    let mut worker = Worker::new(
        WorkerId(0),
        policy,
        buffer,
        Arc::clone(&dev) as Arc<dyn BlockDev>,
        rx,
        messenger,
    );
    let resrc = ResrcAlloc {
        cache_size: 64,
        bandwidth: 1_000_000,
        cpu_cycles: CYCLES_PER_SECOND as i64,
    };
    let tenant = Tenant::new(WorkerId(0), AID, resrc, policy);
    let (client, worker_end) = pair();
    worker.attach_app(tenant, Box::new(worker_end), Vec::new());

    // A freshly created inode has no dirty blocks; fsync still succeeds.
    client.send_request(FsReq::fsync(AID, INO));
    worker.run_loop_inner();
    let reply = client.poll_reply().expect("fsync must be answered");
    assert_eq!(reply.result, FsResult::Done);
}
