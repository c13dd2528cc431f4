//! Control-plane messenger: per-worker FIFO channels.
//!
//! Single producer per logical edge (the allocator, or a peer worker's
//! migration path), single consumer (the receiving worker). Payloads are
//! owned by the receiver after delivery; there is no shared mutation.

use std::sync::mpsc::{Receiver, Sender, channel};
use tenfs_buffer::ExportedSlot;
use tenfs_sched::{AllocDecision, DecisionSink};
use tenfs_types::{AppId, InodeNo, WorkerId};
use tracing::error;

/// Minimal inode metadata travelling with a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMeta {
    pub file_size: u64,
}

/// Messages a worker can receive.
#[derive(Debug)]
pub enum CtrlMsg {
    /// New allocation from the allocator; all fields become effective on
    /// the same loop iteration.
    NewResrcAlloc(AllocDecision),
    /// An inode and its cache slots arriving from another worker.
    InodeMove {
        aid: AppId,
        index: InodeNo,
        meta: InodeMeta,
        slots: Vec<ExportedSlot>,
        src_wid: WorkerId,
    },
    /// Destination confirms one `InodeMove`.
    InodeMoveAck { aid: AppId, index: InodeNo },
}

/// Fan-out of control channels, one per worker.
#[derive(Debug, Clone)]
pub struct Messenger {
    senders: Vec<Sender<CtrlMsg>>,
}

impl Messenger {
    /// Build channels for `num_workers` workers; the receivers are handed
    /// to the worker loops.
    #[must_use]
    pub fn new(num_workers: usize) -> (Self, Vec<Receiver<CtrlMsg>>) {
        let mut senders = Vec::with_capacity(num_workers);
        let mut receivers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }
        (Self { senders }, receivers)
    }

    /// Send to one worker. A closed channel means the worker is gone
    /// during shutdown; the message is dropped with a log line.
    pub fn send(&self, wid: WorkerId, msg: CtrlMsg) {
        if self.senders[wid.index()].send(msg).is_err() {
            error!(event = "ctrl_send_failed", wid = %wid);
        }
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.senders.len()
    }
}

impl DecisionSink for Messenger {
    fn send_decision(&self, wid: WorkerId, decision: AllocDecision) {
        self.send(wid, CtrlMsg::NewResrcAlloc(decision));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenfs_sched::ResrcAlloc;

    #[test]
    fn per_worker_fifo() {
        let (messenger, receivers) = Messenger::new(2);
        for cache in [1_u32, 2, 3] {
            messenger.send_decision(
                WorkerId(1),
                AllocDecision {
                    aid: AppId(0),
                    inode_move: Vec::new(),
                    resrc: ResrcAlloc {
                        cache_size: cache,
                        bandwidth: 0,
                        cpu_cycles: 0,
                    },
                },
            );
        }
        assert!(receivers[0].try_recv().is_err());
        for expect in [1_u32, 2, 3] {
            match receivers[1].try_recv().unwrap() {
                CtrlMsg::NewResrcAlloc(d) => assert_eq!(d.resrc.cache_size, expect),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }
}
