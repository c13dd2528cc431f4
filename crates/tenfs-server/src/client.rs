//! Client transport boundary.
//!
//! Production clients talk to workers over shared-memory SPSC rings; the
//! core only needs FIFO delivery in both directions. [`pair`] builds an
//! in-process channel with the same contract for tests and embedding.

use crate::req::{FsReply, FsReq};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Worker-side view of one app's channel.
pub trait ClientChannel: Send {
    /// Next pending request, if any. Never blocks.
    fn poll_request(&self) -> Option<FsReq>;

    /// Deliver a reply to the client.
    fn push_reply(&self, reply: FsReply);
}

#[derive(Debug, Default)]
struct Shared {
    requests: Mutex<VecDeque<FsReq>>,
    replies: Mutex<VecDeque<FsReply>>,
}

/// App-side endpoint of an in-process channel.
#[derive(Debug, Clone)]
pub struct ClientEndpoint {
    shared: Arc<Shared>,
}

impl ClientEndpoint {
    pub fn send_request(&self, req: FsReq) {
        self.shared.requests.lock().push_back(req);
    }

    #[must_use]
    pub fn poll_reply(&self) -> Option<FsReply> {
        self.shared.replies.lock().pop_front()
    }

    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.shared.replies.lock().len()
    }
}

/// Worker-side endpoint of an in-process channel.
#[derive(Debug)]
pub struct WorkerEndpoint {
    shared: Arc<Shared>,
}

impl ClientChannel for WorkerEndpoint {
    fn poll_request(&self) -> Option<FsReq> {
        self.shared.requests.lock().pop_front()
    }

    fn push_reply(&self, reply: FsReply) {
        self.shared.replies.lock().push_back(reply);
    }
}

/// Build a connected (app, worker) endpoint pair.
#[must_use]
pub fn pair() -> (ClientEndpoint, WorkerEndpoint) {
    let shared = Arc::new(Shared::default());
    (
        ClientEndpoint {
            shared: Arc::clone(&shared),
        },
        WorkerEndpoint { shared },
    )
}
