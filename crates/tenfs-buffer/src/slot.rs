//! Cache slot payload: one block-sized page plus I/O state.

use std::fmt;
use tenfs_types::{BlockReqId, InodeNo};

/// Owned page backing one cache slot. The page travels with the slot on
/// relocation and with the exported item on inode migration.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockData(Box<[u8]>);

impl BlockData {
    #[must_use]
    pub fn zeroed(block_size: usize) -> Self {
        Self(vec![0_u8; block_size].into_boxed_slice())
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockData({} bytes)", self.0.len())
    }
}

/// Per-slot bookkeeping. The fields have very different lifecycles:
///
/// - `data` is allocated once; on LRU reuse the same page serves a new
///   block number.
/// - `index` is maintained on every `get_block`, including reuse; zero
///   means the block is not file data.
/// - `dirty` and `in_mem` are cleared on reuse and set as I/O progresses.
/// - `pending_req` is set when a miss is submitted to the device and
///   cleared when the read completes (`in_mem` flips on).
///
/// Valid states: `in_mem` excludes `pending_req`; `dirty` implies `in_mem`
/// (and the owning buffer pins dirty slots).
#[derive(Debug)]
pub struct BufferSlot {
    data: BlockData,
    index: InodeNo,
    dirty: bool,
    in_mem: bool,
    pending_req: Option<BlockReqId>,
}

impl BufferSlot {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self::from_data(BlockData::zeroed(block_size))
    }

    #[must_use]
    pub fn from_data(data: BlockData) -> Self {
        Self {
            data,
            index: InodeNo::NONE,
            dirty: false,
            in_mem: false,
            pending_req: None,
        }
    }

    /// Clear I/O state for reuse under a new block number. Does not touch
    /// `index`; the buffer rebinds it separately.
    pub fn reset(&mut self) {
        self.in_mem = false;
        self.dirty = false;
        self.pending_req = None;
    }

    /// A read for this slot went to the device.
    pub fn set_io_submitted(&mut self, req: BlockReqId) {
        debug_assert!(!self.in_mem, "submit for a slot already in memory");
        self.pending_req = Some(req);
    }

    /// The read completed; the page now holds the block's data.
    pub fn set_io_done(&mut self) {
        debug_assert!(!self.in_mem, "duplicate I/O completion");
        self.in_mem = true;
        self.pending_req = None;
    }

    /// Flip the dirty flag, returning the previous value.
    pub fn set_dirty(&mut self, dirty: bool) -> bool {
        std::mem::replace(&mut self.dirty, dirty)
    }

    pub fn set_index(&mut self, index: InodeNo) {
        self.index = index;
    }

    #[must_use]
    pub fn index(&self) -> InodeNo {
        self.index
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn is_in_mem(&self) -> bool {
        self.in_mem
    }

    #[must_use]
    pub fn pending_req(&self) -> Option<BlockReqId> {
        self.pending_req
    }

    #[must_use]
    pub fn data(&self) -> &BlockData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BlockData {
        &mut self.data
    }

    /// Take the page out, e.g. for export during migration.
    #[must_use]
    pub fn into_data(self) -> BlockData {
        self.data
    }
}
