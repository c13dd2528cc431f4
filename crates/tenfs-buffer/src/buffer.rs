//! Block number → cache slot mapping with inode grouping and migration.

use crate::flusher::Flusher;
use crate::slot::{BlockData, BufferSlot};
use std::collections::{HashMap, HashSet};
use tenfs_cache::{SharedCache, SlotHandle, Tag};
use tenfs_types::{AppId, BlockNo, InodeNo};
use tracing::{debug, error, trace, warn};

/// What the buffer needs from a tenant on the block-access path: its cache
/// tag, ghost-cache maintenance, and throughput accounting. `Tenant`
/// implements this; keeping it a trait breaks the tenant/buffer dependency
/// cycle.
pub trait CacheClient {
    fn tag(&self) -> Tag;
    fn ghost_access(&mut self, block: BlockNo, is_write: bool);
    fn note_blocks_done(&self, blocks: u32);
}

/// One cache slot packaged for migration to another worker. The page
/// leaves the source pool and is installed verbatim at the destination.
#[derive(Debug)]
pub struct ExportedSlot {
    pub data: BlockData,
    pub block_no: BlockNo,
    pub is_dirty: bool,
    /// Owning app, resolved to a tag at the destination. `None` only in
    /// single-tenant buffers.
    pub aid: Option<AppId>,
}

/// Multi-tenant block buffer: a tag-partitioned slot pool plus an index
/// from inode number to the slots holding that file's blocks.
pub struct BlockBuffer {
    cache: SharedCache<BufferSlot>,
    /// All slots currently bound to a given inode. Actively maintained on
    /// every bind/unbind; inode 0 never appears here.
    block_index_map: HashMap<InodeNo, HashSet<SlotHandle>>,
    pub flusher: Flusher,
    block_size: usize,
    multi_tenant: bool,
    cache_partition: bool,
    name: String,
}

impl BlockBuffer {
    /// Multi-tenant buffer: one partition per configured tag.
    #[must_use]
    pub fn new_multi_tenant(
        config: &[(Tag, usize)],
        block_size: usize,
        cache_partition: bool,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cache: SharedCache::new(config, || BufferSlot::new(block_size)),
            block_index_map: HashMap::new(),
            flusher: Flusher::new(config),
            block_size,
            multi_tenant: true,
            cache_partition,
            name: name.into(),
        }
    }

    /// Single-tenant buffer: every slot under `Tag::Unalloc`. Used for
    /// shared metadata and in tests.
    #[must_use]
    pub fn new_single(block_num: usize, block_size: usize, name: impl Into<String>) -> Self {
        let config = [(Tag::Unalloc, block_num)];
        Self {
            cache: SharedCache::new(&config, || BufferSlot::new(block_size)),
            block_index_map: HashMap::new(),
            flusher: Flusher::new(&config),
            block_size,
            multi_tenant: false,
            cache_partition: false,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cache(&self) -> &SharedCache<BufferSlot> {
        &self.cache
    }

    /// Get a pinned handle for `block_no`, creating a slot on miss.
    ///
    /// Returns `None` when the target partition is full and every slot in
    /// it is pinned; the caller re-queues and retries. A returned slot is
    /// in one of three states: in memory (ready), submitted (a device read
    /// is pending), or neither (the caller must submit).
    pub fn get_block(
        &mut self,
        block_no: BlockNo,
        new_index: InodeNo,
        mut tenant: Option<&mut dyn CacheClient>,
        is_write: bool,
    ) -> Option<SlotHandle> {
        if !self.multi_tenant {
            tenant = None;
        }

        if let Some(handle) = self.cache.lookup(block_no.0, true) {
            // A missed block is submitted to the device and `get_block` is
            // called again once the data arrives, so only the hit path
            // feeds the ghost cache and throughput accounting.
            if let Some(t) = tenant {
                t.ghost_access(block_no, is_write);
                t.note_blocks_done(1);
            }
            debug_assert!(
                new_index.is_none() || self.cache.value(handle).index() == new_index,
                "cache hit under a different inode index"
            );
            return Some(handle);
        }

        let tag = match &tenant {
            Some(t) => {
                if self.cache_partition {
                    t.tag()
                } else {
                    Tag::Global
                }
            }
            None => Tag::Unalloc,
        };
        if is_write && let Some(t) = &tenant {
            t.note_blocks_done(1);
        }

        let handle = self.cache.insert(tag, block_no.0, true, true)?;
        self.cache.value_mut(handle).reset();
        let orig_index = self.cache.value(handle).index();
        if orig_index != new_index {
            // LRU replacement handed us a slot still bound to its old file.
            if !orig_index.is_none()
                && let Some(set) = self.block_index_map.get_mut(&orig_index)
            {
                set.remove(&handle);
                if set.is_empty() {
                    let _ = self.block_index_map.remove(&orig_index);
                }
            }
            if !new_index.is_none() {
                self.block_index_map.entry(new_index).or_default().insert(handle);
            }
            self.cache.value_mut(handle).set_index(new_index);
        }
        Some(handle)
    }

    pub fn release_block(&mut self, handle: SlotHandle) {
        trace!(
            event = "block_release",
            block = self.cache.key_of(handle),
            index = %self.cache.value(handle).index(),
            buffer = %self.name
        );
        self.cache.release(handle);
    }

    /// Mark a slot dirty; on the clean→dirty edge it is registered with
    /// the flusher and pinned (dirty slots are never evicted).
    pub fn set_block_dirty(&mut self, handle: SlotHandle, item_index: InodeNo) {
        let was_dirty = self.cache.value_mut(handle).set_dirty(true);
        if !was_dirty {
            let tag = self.cache.tag_of(handle);
            self.flusher.add_dirty_item(handle, item_index, tag);
            self.cache.pin(handle);
        }
    }

    /// Clear a slot's dirty flag; on the dirty→clean edge the flusher
    /// entry and the dirty pin are dropped.
    pub fn unset_block_dirty(&mut self, handle: SlotHandle) {
        let was_dirty = self.cache.value_mut(handle).set_dirty(false);
        if was_dirty {
            let index = self.cache.value(handle).index();
            self.flusher.remove_dirty_item(handle, index);
            self.cache.release(handle);
        }
    }

    /// On inode unlink, drop every dirty binding of `index` without
    /// flushing. The flusher's count must reconcile exactly with the
    /// dirty flags we just cleared.
    pub fn release_unlinked_inode_dirty_blocks(&mut self, index: InodeNo) {
        assert!(index.0 > 1, "cannot unlink the root inode");
        let mut num_actual_dirty = 0;
        if let Some(handles) = self.block_index_map.remove(&index) {
            for handle in handles {
                if self.cache.value_mut(handle).set_dirty(false) {
                    num_actual_dirty += 1;
                    self.cache.release(handle);
                }
            }
        }
        let num_tracked = self.flusher.remove_dirty_items_by_index(index);
        assert_eq!(
            num_tracked, num_actual_dirty,
            "dirty accounting diverged for unlinked inode {index}"
        );
    }

    /// Export every slot bound to `index` for migration. The caller must
    /// have drained in-flight requests first; a still-pinned slot is a
    /// fatal bookkeeping error. Under cache partitioning each exported
    /// slot is replenished from the free pool so partition sizes stay
    /// invariant.
    ///
    /// Returns `None` when no slot is bound to `index`.
    pub fn split_buffer_items_by_index(&mut self, index: InodeNo) -> Option<Vec<ExportedSlot>> {
        let handles = self.block_index_map.remove(&index)?;
        let mut exported = Vec::with_capacity(handles.len());
        for handle in handles {
            let tag = self.cache.tag_of(handle);
            let block_no = BlockNo(self.cache.key_of(handle));
            let is_dirty = self.cache.value(handle).is_dirty();
            if is_dirty {
                // Drop the dirty pin; the flusher entries for this index
                // are removed wholesale below.
                self.cache.release(handle);
            }
            let Some(slot) = self.cache.erase(handle) else {
                error!(
                    event = "export_pinned_block",
                    index = %index,
                    block = block_no.0,
                    buffer = %self.name
                );
                panic!("failed to export inode {index}: block {block_no} is pinned");
            };
            let aid = match tag {
                Tag::Tenant(aid) => Some(aid),
                Tag::Unalloc | Tag::Global => None,
            };
            exported.push(ExportedSlot {
                data: slot.into_data(),
                block_no,
                is_dirty,
                aid,
            });
            if self.cache_partition {
                // Export shrank this partition by one; refill from the
                // free pool.
                let moved = self.cache.relocate(Tag::Unalloc, tag, 1);
                if moved != 1 {
                    warn!(
                        event = "export_refill_short",
                        tag = %tag,
                        "failed to add cache slot after export"
                    );
                }
            }
        }
        let _ = self.flusher.remove_dirty_items_by_index(index);
        debug!(event = "inode_export", index = %index, num_blocks = exported.len());
        Some(exported)
    }

    /// Install slots exported from another worker under `index`. Dirty
    /// slots re-register with the flusher and re-pin; each installed slot
    /// returns one free slot to the pool so partition sizes stay
    /// invariant.
    pub fn install_buffer_items_of_index(&mut self, index: InodeNo, items: Vec<ExportedSlot>) {
        if items.is_empty() {
            return;
        }
        let num_blocks = items.len();
        for item in items {
            let tag = item.aid.map_or(Tag::Unalloc, Tag::Tenant);
            let mut slot = BufferSlot::from_data(item.data);
            slot.set_index(index);
            // Equivalent to having just completed the read: in memory, no
            // pending request.
            slot.set_io_done();
            let handle = self.cache.install(tag, item.block_no.0, slot);
            if item.is_dirty {
                let _ = self.cache.value_mut(handle).set_dirty(true);
                self.flusher.add_dirty_item(handle, index, tag);
                self.cache.pin(handle);
            }
            self.block_index_map.entry(index).or_default().insert(handle);
            if self.cache_partition {
                let moved = self.cache.relocate(tag, Tag::Unalloc, 1);
                if moved != 1 {
                    warn!(
                        event = "install_trim_short",
                        tag = %tag,
                        "failed to reduce cache slot after import"
                    );
                }
            }
        }
        debug!(event = "inode_install", index = %index, num_blocks);
    }

    /// Grow or shrink a tenant partition to its newly allocated size by
    /// trading slots with the free pool.
    pub fn adjust_cache_size(&mut self, tag: Tag, new_size: usize) {
        assert!(
            self.cache_partition,
            "cache size adjustment requires cache partitioning"
        );
        let old_size = self.cache.capacity_of(tag);
        debug!(event = "cache_resize", tag = %tag, old_size, new_size);
        if old_size < new_size {
            let want = new_size - old_size;
            let done = self.cache.relocate(Tag::Unalloc, tag, want);
            if done != want {
                warn!(
                    event = "cache_resize_short",
                    tag = %tag,
                    want,
                    done,
                    "expected to give more slots than the free pool held"
                );
            }
        } else if old_size > new_size {
            let want = old_size - new_size;
            let done = self.cache.relocate(tag, Tag::Unalloc, want);
            if done != want {
                warn!(
                    event = "cache_resize_short",
                    tag = %tag,
                    want,
                    done,
                    "expected to take more slots than were unpinned"
                );
            }
        }
        self.flusher
            .set_tenant_capacity(tag, self.cache.capacity_of(tag));
    }

    /// Resident slot count across all tags.
    #[must_use]
    pub fn current_item_num(&self) -> usize {
        let mut num = 0;
        self.cache.for_each(|_, _, _, _| num += 1);
        num
    }

    /// Inodes with at least one resident slot owned by `tag`.
    #[must_use]
    pub fn indices_of_tag(&self, tag: Tag) -> Vec<InodeNo> {
        let mut indices: Vec<InodeNo> = Vec::new();
        for (&index, handles) in &self.block_index_map {
            if handles
                .iter()
                .any(|&h| self.cache.tag_of(h) == tag)
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        indices
    }

    // Slot state passthroughs used by the worker on the I/O path.

    #[must_use]
    pub fn slot(&self, handle: SlotHandle) -> &BufferSlot {
        self.cache.value(handle)
    }

    pub fn slot_mut(&mut self, handle: SlotHandle) -> &mut BufferSlot {
        self.cache.value_mut(handle)
    }

    #[must_use]
    pub fn block_no_of(&self, handle: SlotHandle) -> BlockNo {
        BlockNo(self.cache.key_of(handle))
    }
}

impl std::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("multi_tenant", &self.multi_tenant)
            .field("resident", &self.current_item_num())
            .field("dirty", &self.flusher.dirty_item_num())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 32;

    fn small_buffer() -> BlockBuffer {
        BlockBuffer::new_single(4, BLOCK_SIZE, "utest")
    }

    #[test]
    fn single_block() {
        let mut buffer = small_buffer();
        let handle = buffer.get_block(BlockNo(1000), InodeNo::NONE, None, false).unwrap();
        assert_eq!(buffer.block_no_of(handle), BlockNo(1000));
        assert!(!buffer.slot(handle).is_in_mem());
        assert!(!buffer.slot(handle).is_dirty());
        buffer.release_block(handle);
    }

    #[test]
    fn get_twice_returns_same_slot() {
        let mut buffer = small_buffer();
        for no in [1000, 1001, 1002, 1003] {
            let handle = buffer.get_block(BlockNo(no), InodeNo::NONE, None, false).unwrap();
            let again = buffer.get_block(BlockNo(no), InodeNo::NONE, None, false).unwrap();
            assert_eq!(handle, again);
            buffer.release_block(handle);
            buffer.release_block(again);
        }
    }

    #[test]
    fn full_buffer_rejects_then_recovers() {
        let mut buffer = small_buffer();
        let mut handles = Vec::new();
        for no in [1000, 1001, 1002, 1003] {
            handles.push(buffer.get_block(BlockNo(no), InodeNo::NONE, None, false).unwrap());
        }
        // Every slot pinned: no room.
        assert!(buffer.get_block(BlockNo(1004), InodeNo::NONE, None, false).is_none());
        assert!(buffer.get_block(BlockNo(1005), InodeNo::NONE, None, false).is_none());

        buffer.release_block(handles.remove(0));
        buffer.release_block(handles.remove(0));

        for no in [1004, 1005] {
            handles.push(buffer.get_block(BlockNo(no), InodeNo::NONE, None, false).unwrap());
        }
        for handle in handles {
            buffer.release_block(handle);
        }
    }

    #[test]
    fn dirty_set_and_unset_balance() {
        let mut buffer = small_buffer();
        let handle = buffer.get_block(BlockNo(1000), InodeNo::NONE, None, false).unwrap();
        buffer.set_block_dirty(handle, InodeNo::NONE);
        assert!(buffer.slot(handle).is_dirty());
        assert_eq!(buffer.flusher.dirty_item_num(), 1);

        buffer.unset_block_dirty(handle);
        assert!(!buffer.slot(handle).is_dirty());
        assert_eq!(buffer.flusher.dirty_item_num(), 0);
        buffer.release_block(handle);
    }

    #[test]
    fn dirty_slot_is_pinned_until_clean() {
        let mut buffer = small_buffer();
        let handle = buffer.get_block(BlockNo(1), InodeNo::NONE, None, false).unwrap();
        buffer.set_block_dirty(handle, InodeNo::NONE);
        buffer.release_block(handle);
        // The dirty pin remains.
        assert!(buffer.cache().refcount_of(handle) >= 1);
        buffer.unset_block_dirty(handle);
        assert_eq!(buffer.cache().refcount_of(handle), 0);
    }

    #[test]
    fn flusher_threshold_and_batching() {
        const BLOCK_NUM: usize = 800;
        let mut buffer = BlockBuffer::new_single(BLOCK_NUM, BLOCK_SIZE, "flush-utest");
        buffer.flusher.set_dirty_ratio(0.2);
        buffer.flusher.set_dirty_flush_one_time_submit_num(100);

        let threshold = (BLOCK_NUM as f64 * 0.2) as usize;
        let mut next_block = 1000_u64;
        for _ in 0..threshold {
            let h = buffer.get_block(BlockNo(next_block), InodeNo::NONE, None, false).unwrap();
            next_block += 1;
            buffer.set_block_dirty(h, InodeNo::NONE);
            buffer.release_block(h);
        }
        assert_eq!(buffer.flusher.dirty_item_num(), threshold);
        assert!(!buffer.flusher.check_if_need_bg_flush());

        // One more pushes the ratio strictly above the threshold.
        let h = buffer.get_block(BlockNo(next_block), InodeNo::NONE, None, false).unwrap();
        buffer.set_block_dirty(h, InodeNo::NONE);
        buffer.release_block(h);
        let num_dirty = threshold + 1;
        assert!(buffer.flusher.check_if_need_bg_flush());

        let batch = buffer.flusher.do_flush();
        assert!(batch.can_flush);
        assert_eq!(batch.handles.len(), 100);
        assert!(buffer.flusher.bg_flush_sent());
        buffer.flusher.add_fg_flush_inflight_num(1);

        // A second selection is rejected while the first is in flight.
        buffer.flusher.set_fg_flush_limit(1);
        let blocked = buffer.flusher.do_flush();
        assert!(!blocked.can_flush);
        assert!(blocked.handles.is_empty());

        for handle in &batch.handles {
            buffer.unset_block_dirty(*handle);
        }
        buffer.flusher.do_flush_done().unwrap();
        buffer.flusher.add_fg_flush_inflight_num(-1);
        assert_eq!(buffer.flusher.dirty_item_num(), num_dirty - 100);
        assert!(!buffer.flusher.check_if_need_bg_flush());

        let batch = buffer.flusher.do_flush();
        assert!(batch.can_flush);
        assert_eq!(batch.handles.len(), (num_dirty - 100).min(100));
        buffer.flusher.add_fg_flush_inflight_num(1);
        for handle in &batch.handles {
            buffer.unset_block_dirty(*handle);
        }
        buffer.flusher.do_flush_done().unwrap();
        buffer.flusher.add_fg_flush_inflight_num(-1);
        assert_eq!(buffer.flusher.dirty_item_num(), 0);
    }

    #[test]
    fn flush_done_without_flush_fails() {
        let mut buffer = small_buffer();
        assert!(buffer.flusher.do_flush_done().is_err());
    }

    #[test]
    fn unlinked_inode_drops_dirty_state() {
        let mut buffer = small_buffer();
        let ino = InodeNo(5);
        let h1 = buffer.get_block(BlockNo(10), ino, None, true).unwrap();
        let h2 = buffer.get_block(BlockNo(11), ino, None, true).unwrap();
        buffer.set_block_dirty(h1, ino);
        buffer.set_block_dirty(h2, ino);
        buffer.release_block(h1);
        buffer.release_block(h2);

        buffer.release_unlinked_inode_dirty_blocks(ino);
        assert_eq!(buffer.flusher.dirty_item_num(), 0);
        assert!(!buffer.flusher.has_dirty_index(ino));
        assert!(!buffer.slot(h1).is_dirty());
        assert_eq!(buffer.cache().refcount_of(h1), 0);
    }

    fn tenant_config(aid: u32, cap: usize, unalloc: usize) -> Vec<(Tag, usize)> {
        vec![(Tag::Tenant(AppId(aid)), cap), (Tag::Unalloc, unalloc)]
    }

    struct TestClient {
        tag: Tag,
    }

    impl CacheClient for TestClient {
        fn tag(&self) -> Tag {
            self.tag
        }
        fn ghost_access(&mut self, _block: BlockNo, _is_write: bool) {}
        fn note_blocks_done(&self, _blocks: u32) {}
    }

    #[test]
    fn export_install_round_trip_preserves_slots() {
        let mut src =
            BlockBuffer::new_multi_tenant(&tenant_config(0, 4, 4), BLOCK_SIZE, true, "src");
        let mut dst =
            BlockBuffer::new_multi_tenant(&tenant_config(0, 4, 4), BLOCK_SIZE, true, "dst");
        let mut client = TestClient {
            tag: Tag::Tenant(AppId(0)),
        };
        let ino = InodeNo(7);

        let h1 = src.get_block(BlockNo(100), ino, Some(&mut client), true).unwrap();
        src.slot_mut(h1).set_io_done();
        src.slot_mut(h1).data_mut().as_mut_slice()[0] = 0xAB;
        src.set_block_dirty(h1, ino);
        src.release_block(h1);

        let h2 = src.get_block(BlockNo(101), ino, Some(&mut client), false).unwrap();
        src.slot_mut(h2).set_io_done();
        src.release_block(h2);

        let src_cap_before = src.cache().capacity_of(Tag::Tenant(AppId(0)));
        let exported = src.split_buffer_items_by_index(ino).unwrap();
        assert_eq!(exported.len(), 2);
        assert_eq!(src.flusher.dirty_item_num(), 0);
        assert!(!src.flusher.has_dirty_index(ino));
        // Partition size invariant after export.
        assert_eq!(src.cache().capacity_of(Tag::Tenant(AppId(0))), src_cap_before);

        let dst_cap_before = dst.cache().capacity_of(Tag::Tenant(AppId(0)));
        dst.install_buffer_items_of_index(ino, exported);
        assert_eq!(dst.cache().capacity_of(Tag::Tenant(AppId(0))), dst_cap_before);

        // The dirty block arrived dirty, pinned, and in memory.
        let h = dst.get_block(BlockNo(100), ino, Some(&mut client), false).unwrap();
        assert!(dst.slot(h).is_in_mem());
        assert!(dst.slot(h).is_dirty());
        assert_eq!(dst.slot(h).data().as_slice()[0], 0xAB);
        dst.release_block(h);

        let h = dst.get_block(BlockNo(101), ino, Some(&mut client), false).unwrap();
        assert!(dst.slot(h).is_in_mem());
        assert!(!dst.slot(h).is_dirty());
        dst.release_block(h);
        assert_eq!(dst.flusher.dirty_item_num(), 1);
    }

    #[test]
    fn split_absent_index_is_an_error() {
        let mut buffer =
            BlockBuffer::new_multi_tenant(&tenant_config(0, 4, 4), BLOCK_SIZE, true, "src");
        assert!(buffer.split_buffer_items_by_index(InodeNo(9)).is_none());
    }

    #[test]
    fn adjust_cache_size_moves_slots_both_ways() {
        let mut buffer =
            BlockBuffer::new_multi_tenant(&tenant_config(0, 4, 8), BLOCK_SIZE, true, "resize");
        let tag = Tag::Tenant(AppId(0));
        buffer.adjust_cache_size(tag, 8);
        assert_eq!(buffer.cache().capacity_of(tag), 8);
        assert_eq!(buffer.cache().capacity_of(Tag::Unalloc), 4);
        buffer.adjust_cache_size(tag, 2);
        assert_eq!(buffer.cache().capacity_of(tag), 2);
        assert_eq!(buffer.cache().capacity_of(Tag::Unalloc), 10);
        assert_eq!(buffer.flusher.tenant_info(tag).unwrap().capacity, 2);
    }
}
