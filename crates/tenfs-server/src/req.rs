//! Request and reply types flowing between clients, workers, and the
//! device layer.

use tenfs_types::{AppId, BlockNo, BlockReqId, InodeNo};

/// What a client asks of the filesystem. Block-granular: reads and writes
/// cover one whole block of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    Read { block: BlockNo },
    Write { block: BlockNo, data: Vec<u8> },
    /// Flush every dirty block of the inode.
    Fsync,
}

/// A client request as it travels through a tenant's queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsReq {
    pub aid: AppId,
    pub ino: InodeNo,
    pub op: FsOp,
}

impl FsReq {
    #[must_use]
    pub fn read(aid: AppId, ino: InodeNo, block: BlockNo) -> Self {
        Self {
            aid,
            ino,
            op: FsOp::Read { block },
        }
    }

    #[must_use]
    pub fn write(aid: AppId, ino: InodeNo, block: BlockNo, data: Vec<u8>) -> Self {
        Self {
            aid,
            ino,
            op: FsOp::Write { block, data },
        }
    }

    #[must_use]
    pub fn fsync(aid: AppId, ino: InodeNo) -> Self {
        Self {
            aid,
            ino,
            op: FsOp::Fsync,
        }
    }
}

/// Outcome delivered back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsResult {
    Data(Vec<u8>),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsReply {
    pub aid: AppId,
    pub ino: InodeNo,
    pub result: FsResult,
}

/// A device read waiting in a tenant's block queue for a rate-limit
/// permit. The slot handle is pinned until the read completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReq {
    pub id: BlockReqId,
    pub block_no: BlockNo,
    pub handle: tenfs_cache::SlotHandle,
}
