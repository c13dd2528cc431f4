//! Dirty-block accounting and flush pacing for one block buffer.
//!
//! Two flush flavors share this state:
//! - **Background (BG)**: triggered when some tenant's dirty ratio crosses
//!   the threshold; at most one BG batch is in flight at a time, and BG
//!   always defers to pending foreground work.
//! - **Foreground (FG)**: fsync-like flushes of one inode's dirty blocks,
//!   bounded by `fg_flush_limit` concurrent submissions; inodes that could
//!   not start yet wait in `fg_indices`.

use std::collections::{HashMap, HashSet};
use tenfs_cache::{SlotHandle, Tag};
use tenfs_error::{Result, TenfsError};
use tenfs_types::InodeNo;
use tracing::{debug, error, trace};

/// Per-tenant dirty accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantFlushInfo {
    pub capacity: usize,
    pub num_dirty: usize,
}

impl TenantFlushInfo {
    #[must_use]
    pub fn dirty_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.num_dirty as f64 / self.capacity as f64
        }
    }

    #[must_use]
    fn is_above_threshold(&self, threshold: f64) -> bool {
        self.dirty_ratio() > threshold
    }
}

/// Result of one flush-selection pass.
#[derive(Debug, Default)]
pub struct FlushBatch {
    /// False when the FG in-flight limit blocked selection.
    pub can_flush: bool,
    pub handles: Vec<SlotHandle>,
}

#[derive(Debug)]
pub struct Flusher {
    tenant_info: HashMap<Tag, TenantFlushInfo>,
    /// Dirty slots grouped by inode; each remembers its owning tag.
    dirty_index_map: HashMap<InodeNo, HashMap<SlotHandle, Tag>>,
    num_fg_flush: usize,
    fg_flush_limit: usize,
    /// At most one background batch in flight.
    bg_flush_sent: bool,
    /// Flushing starts when a tenant's dirty ratio exceeds this; the
    /// default of 1.0 disables proactive flushing.
    dirty_ratio_threshold: f64,
    /// Blocks submitted per background batch.
    dirty_flush_one_time_submit_num: usize,
    /// Inodes waiting for a foreground flush window.
    fg_indices: HashSet<InodeNo>,
}

impl Flusher {
    pub const DEFAULT_FG_FLUSH_LIMIT: usize = tenfs_types::params::FG_FLUSH_LIMIT;

    #[must_use]
    pub fn new(config: &[(Tag, usize)]) -> Self {
        let mut tenant_info: HashMap<Tag, TenantFlushInfo> = HashMap::new();
        for &(tag, capacity) in config {
            let info = tenant_info.entry(tag).or_default();
            info.capacity += capacity;
        }
        Self {
            tenant_info,
            dirty_index_map: HashMap::new(),
            num_fg_flush: 0,
            fg_flush_limit: Self::DEFAULT_FG_FLUSH_LIMIT,
            bg_flush_sent: false,
            dirty_ratio_threshold: 1.0,
            dirty_flush_one_time_submit_num: 0,
            fg_indices: HashSet::new(),
        }
    }

    /// True iff a background batch should go out now: nothing BG or FG in
    /// flight, no inode waiting for an FG window, and some tenant above
    /// its dirty-ratio threshold.
    #[must_use]
    pub fn check_if_need_bg_flush(&self) -> bool {
        if self.bg_flush_sent {
            return false;
        }
        if self.num_fg_flush > 0 || !self.fg_indices.is_empty() {
            return false;
        }
        self.tenant_info
            .values()
            .any(|info| info.is_above_threshold(self.dirty_ratio_threshold))
    }

    /// Select blocks to flush. `InodeNo::NONE` means a background batch
    /// (breadth-first across inodes, bounded by the one-time submit
    /// count); a real inode means an fsync-like foreground flush of all
    /// its dirty blocks. A missing inode entry yields an empty batch —
    /// newly created files have no dirtied blocks yet.
    pub fn do_flush_by_index(&mut self, index: InodeNo) -> FlushBatch {
        let mut batch = FlushBatch {
            can_flush: true,
            handles: Vec::new(),
        };
        if self.check_if_fg_flush_reach_limit() {
            batch.can_flush = false;
            return batch;
        }

        if index.is_none() {
            'outer: for handles in self.dirty_index_map.values() {
                for &handle in handles.keys() {
                    batch.handles.push(handle);
                    if batch.handles.len() >= self.dirty_flush_one_time_submit_num {
                        break 'outer;
                    }
                }
            }
            if !batch.handles.is_empty() {
                self.bg_flush_sent = true;
            }
        } else if let Some(handles) = self.dirty_index_map.get(&index) {
            batch.handles.extend(handles.keys().copied());
        }
        trace!(
            event = "flush_select",
            index = %index,
            num_blocks = batch.handles.len(),
            bg = index.is_none()
        );
        batch
    }

    /// Background-flush selection.
    pub fn do_flush(&mut self) -> FlushBatch {
        self.do_flush_by_index(InodeNo::NONE)
    }

    /// A flush batch completed. Fails if nothing was in flight.
    pub fn do_flush_done(&mut self) -> Result<()> {
        if !self.bg_flush_sent && self.num_fg_flush == 0 {
            error!(
                event = "flush_done_without_flush",
                bg_sent = self.bg_flush_sent,
                fg_num = self.num_fg_flush
            );
            return Err(TenfsError::NoFlushInFlight);
        }
        self.bg_flush_sent = false;
        Ok(())
    }

    pub fn add_dirty_item(&mut self, handle: SlotHandle, index: InodeNo, tag: Tag) {
        self.dirty_index_map.entry(index).or_default().insert(handle, tag);
        let info = self.tenant_info.entry(tag).or_default();
        info.num_dirty += 1;
        debug!(event = "dirty_add", index = %index, tag = %tag, num_dirty = info.num_dirty);
    }

    pub fn remove_dirty_item(&mut self, handle: SlotHandle, index: InodeNo) {
        let Some(handles) = self.dirty_index_map.get_mut(&index) else {
            error!(event = "dirty_remove_unknown_index", index = %index);
            panic!("removing dirty block under untracked index {index}");
        };
        let Some(tag) = handles.remove(&handle) else {
            error!(event = "dirty_remove_unknown_handle", index = %index);
            panic!("removing untracked dirty block under index {index}");
        };
        if handles.is_empty() {
            let _ = self.dirty_index_map.remove(&index);
        }
        let info = self
            .tenant_info
            .get_mut(&tag)
            .expect("dirty block always has tenant info");
        info.num_dirty -= 1;
        debug!(event = "dirty_remove", index = %index, tag = %tag, num_dirty = info.num_dirty);
    }

    /// Drop all dirty accounting for one inode, returning how many blocks
    /// were tracked.
    pub fn remove_dirty_items_by_index(&mut self, index: InodeNo) -> usize {
        let Some(handles) = self.dirty_index_map.remove(&index) else {
            return 0;
        };
        let num = handles.len();
        for tag in handles.values() {
            let info = self
                .tenant_info
                .get_mut(tag)
                .expect("dirty block always has tenant info");
            info.num_dirty -= 1;
        }
        debug!(event = "dirty_remove_index", index = %index, num);
        num
    }

    pub fn add_fg_flush_wait_index(&mut self, index: InodeNo) {
        trace!(event = "fg_wait_add", index = %index);
        self.fg_indices.insert(index);
    }

    pub fn remove_fg_flush_wait_index(&mut self, index: InodeNo) {
        if !self.fg_indices.remove(&index) {
            trace!(event = "fg_wait_remove_missing", index = %index);
        }
    }

    #[must_use]
    pub fn check_if_idx_fg_flush_inflight(&self, index: InodeNo) -> bool {
        self.fg_indices.contains(&index)
    }

    #[must_use]
    pub fn fg_wait_indices(&self) -> Vec<InodeNo> {
        self.fg_indices.iter().copied().collect()
    }

    #[must_use]
    pub fn check_if_fg_flush_reach_limit(&self) -> bool {
        self.num_fg_flush >= self.fg_flush_limit
    }

    #[must_use]
    pub fn check_if_fg_flush_inflight(&self) -> bool {
        self.num_fg_flush > 0
    }

    /// Adjust the FG in-flight count (+1 on submit, -1 on completion).
    pub fn add_fg_flush_inflight_num(&mut self, delta: isize) {
        self.num_fg_flush = self
            .num_fg_flush
            .checked_add_signed(delta)
            .expect("foreground flush accounting underflow");
    }

    pub fn set_dirty_ratio(&mut self, ratio: f64) {
        assert!((0.0..=1.0).contains(&ratio));
        self.dirty_ratio_threshold = ratio;
    }

    pub fn set_dirty_flush_one_time_submit_num(&mut self, n: usize) {
        self.dirty_flush_one_time_submit_num = n;
    }

    pub fn set_fg_flush_limit(&mut self, n: usize) {
        self.fg_flush_limit = n;
    }

    /// Track a partition-size change so dirty ratios stay meaningful.
    pub fn set_tenant_capacity(&mut self, tag: Tag, capacity: usize) {
        self.tenant_info.entry(tag).or_default().capacity = capacity;
    }

    #[must_use]
    pub fn tenant_info(&self, tag: Tag) -> Option<TenantFlushInfo> {
        self.tenant_info.get(&tag).copied()
    }

    #[must_use]
    pub fn bg_flush_sent(&self) -> bool {
        self.bg_flush_sent
    }

    /// Total dirty blocks tracked across all inodes.
    #[must_use]
    pub fn dirty_item_num(&self) -> usize {
        self.dirty_index_map.values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn has_dirty_index(&self, index: InodeNo) -> bool {
        self.dirty_index_map.contains_key(&index)
    }
}
