#![forbid(unsafe_code)]
//! Inode migration between two workers, driven loop by loop.
//!
//! Scenario: worker 0's tenant has a device read in flight when the
//! allocator orders a migration. The tenant drains (no migration while
//! anything is in flight), exports the inode's slots once idle, and the
//! destination serves the migrated blocks from memory with dirty state
//! preserved.

use std::sync::Arc;
use tenfs_buffer::BlockBuffer;
use tenfs_cache::Tag;
use tenfs_sched::{AllocDecision, ResrcAlloc, Tenant};
use tenfs_server::client::{ClientEndpoint, pair};
use tenfs_server::dev::MemBlockDev;
use tenfs_server::msg::{CtrlMsg, Messenger};
use tenfs_server::req::{FsReq, FsResult};
use tenfs_server::worker::Worker;
use tenfs_types::params::CYCLES_PER_SECOND;
use tenfs_types::{AppId, BLOCK_SIZE, BlockNo, InodeNo, Policy, WorkerId};

const AID: AppId = AppId(0);
const INO: InodeNo = InodeNo(5);
const CACHE_BLOCKS: usize = 128;

fn tenant_resrc() -> ResrcAlloc {
    ResrcAlloc {
        cache_size: CACHE_BLOCKS as u32,
        bandwidth: 1_000_000, // effectively unlimited for this test
        cpu_cycles: CYCLES_PER_SECOND as i64,
    }
}

fn make_worker(
    wid: u32,
    dev: &Arc<MemBlockDev>,
    messenger: &Messenger,
    ctrl_rx: std::sync::mpsc::Receiver<CtrlMsg>,
) -> (Worker, ClientEndpoint) {
    let policy = Policy::default();
    let tags = [
        (Tag::Tenant(AID), CACHE_BLOCKS),
        (Tag::Unalloc, 2 * CACHE_BLOCKS),
    ];
    let buffer = BlockBuffer::new_multi_tenant(&tags, BLOCK_SIZE, true, format!("w{wid}"));
    let mut worker = Worker::new(
        WorkerId(wid),
        policy,
        buffer,
        Arc::clone(dev) as Arc<dyn tenfs_server::dev::BlockDev>,
        ctrl_rx,
        messenger.clone(),
    );
    let tenant = Tenant::new(WorkerId(wid), AID, tenant_resrc(), policy);
    let (client, worker_end) = pair();
    worker.attach_app(tenant, Box::new(worker_end), Vec::new());
    (worker, client)
}

fn drain_replies(client: &ClientEndpoint) -> Vec<FsResult> {
    let mut results = Vec::new();
    while let Some(reply) = client.poll_reply() {
        results.push(reply.result);
    }
    results
}

#[test]
fn drain_then_migrate_preserves_cache_state() {
    // Reads complete only after three polls, keeping them observably in
    // flight across loop iterations.
    let dev = Arc::new(MemBlockDev::with_latency(BLOCK_SIZE, 3));
    dev.preload(BlockNo(200), vec![0x55; BLOCK_SIZE]);

    let (messenger, mut receivers) = Messenger::new(2);
    let rx1 = receivers.pop().unwrap();
    let rx0 = receivers.pop().unwrap();
    let (mut w0, client0) = make_worker(0, &dev, &messenger, rx0);
    let (mut w1, client1) = make_worker(1, &dev, &messenger, rx1);

    // Dirty four blocks of the inode on worker 0.
    for block in 100..104_u64 {
        client0.send_request(FsReq::write(AID, INO, BlockNo(block), vec![block as u8; BLOCK_SIZE]));
    }
    for _ in 0..4 {
        w0.run_loop_inner();
    }
    assert_eq!(drain_replies(&client0).len(), 4);
    assert_eq!(w0.buffer().flusher.dirty_item_num(), 4);
    assert_eq!(w0.num_inodes(AID), 1);

    // A read of an uncached block goes to the device and stays in flight.
    client0.send_request(FsReq::read(AID, INO, BlockNo(200)));
    w0.run_loop_inner();
    assert_eq!(w0.tenant(AID).unwrap().num_reqs_inflight(), 1);

    // The allocator orders one file moved to worker 1.
    messenger.send(
        WorkerId(0),
        CtrlMsg::NewResrcAlloc(AllocDecision {
            aid: AID,
            inode_move: vec![(WorkerId(1), 1)],
            resrc: tenant_resrc(),
        }),
    );
    w0.run_loop_inner();
    let tenant = w0.tenant(AID).unwrap();
    assert!(tenant.is_drain());
    assert!(
        !tenant.should_migrate(),
        "migration must wait for in-flight requests"
    );

    // Let the read complete; the drain then reaches zero in-flight and
    // the export goes out.
    for _ in 0..6 {
        w0.run_loop_inner();
    }
    let results = drain_replies(&client0);
    assert_eq!(results, vec![FsResult::Data(vec![0x55; BLOCK_SIZE])]);
    assert!(w0.tenant(AID).unwrap().should_migrate() || w0.num_inodes(AID) == 0);

    for _ in 0..4 {
        w0.run_loop_inner();
        w1.run_loop_inner();
    }

    // Drain is acknowledged and cleared; the inode now lives on worker 1.
    assert!(!w0.tenant(AID).unwrap().is_drain());
    assert_eq!(w0.num_inodes(AID), 0);
    assert_eq!(w1.num_inodes(AID), 1);
    // Dirty accounting travelled with the blocks.
    assert_eq!(w0.buffer().flusher.dirty_item_num(), 0);
    assert_eq!(w1.buffer().flusher.dirty_item_num(), 4);
    // Partition sizes stayed invariant on both sides.
    assert_eq!(w0.buffer().cache().capacity_of(Tag::Tenant(AID)), CACHE_BLOCKS);
    assert_eq!(w1.buffer().cache().capacity_of(Tag::Tenant(AID)), CACHE_BLOCKS);

    // The destination serves a migrated dirty block from memory.
    client1.send_request(FsReq::read(AID, INO, BlockNo(101)));
    w1.run_loop_inner();
    let results = drain_replies(&client1);
    assert_eq!(results, vec![FsResult::Data(vec![101; BLOCK_SIZE])]);
    // Served from memory: nothing new went to the device.
    assert_eq!(dev.inflight_len(), 0);
}

/// Round trip: migrating an inode away and back restores the original
/// buffer contents and dirty set.
#[test]
fn migration_round_trip_is_lossless() {
    let dev = Arc::new(MemBlockDev::new(BLOCK_SIZE));
    let (messenger, mut receivers) = Messenger::new(2);
    let rx1 = receivers.pop().unwrap();
    let rx0 = receivers.pop().unwrap();
    let (mut w0, client0) = make_worker(0, &dev, &messenger, rx0);
    let (mut w1, _client1) = make_worker(1, &dev, &messenger, rx1);

    client0.send_request(FsReq::write(AID, INO, BlockNo(10), vec![1; BLOCK_SIZE]));
    client0.send_request(FsReq::write(AID, INO, BlockNo(11), vec![2; BLOCK_SIZE]));
    for _ in 0..3 {
        w0.run_loop_inner();
    }
    assert_eq!(w0.buffer().flusher.dirty_item_num(), 2);

    // There → w1.
    messenger.send(
        WorkerId(0),
        CtrlMsg::NewResrcAlloc(AllocDecision {
            aid: AID,
            inode_move: vec![(WorkerId(1), 1)],
            resrc: tenant_resrc(),
        }),
    );
    for _ in 0..4 {
        w0.run_loop_inner();
        w1.run_loop_inner();
    }
    assert_eq!(w1.num_inodes(AID), 1);
    assert_eq!(w1.buffer().flusher.dirty_item_num(), 2);

    // And back → w0.
    messenger.send(
        WorkerId(1),
        CtrlMsg::NewResrcAlloc(AllocDecision {
            aid: AID,
            inode_move: vec![(WorkerId(0), 1)],
            resrc: tenant_resrc(),
        }),
    );
    for _ in 0..4 {
        w1.run_loop_inner();
        w0.run_loop_inner();
    }
    assert_eq!(w0.num_inodes(AID), 1);
    assert_eq!(w0.buffer().flusher.dirty_item_num(), 2);

    // Contents and dirty flags are exactly as before the round trip.
    client0.send_request(FsReq::read(AID, INO, BlockNo(10)));
    client0.send_request(FsReq::read(AID, INO, BlockNo(11)));
    for _ in 0..3 {
        w0.run_loop_inner();
    }
    let results = drain_replies(&client0);
    assert_eq!(
        results,
        vec![
            FsResult::Data(vec![1; BLOCK_SIZE]),
            FsResult::Data(vec![2; BLOCK_SIZE]),
        ]
    );
}
