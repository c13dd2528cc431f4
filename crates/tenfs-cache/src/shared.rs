//! Fixed slot pool partitioned by tag, with per-tag LRU and pinning.
//!
//! The pool is an arena of entries addressed by [`SlotHandle`]. An entry is
//! either resident (holds a key, linked into its tag's LRU list), free
//! (owned by a tag but unkeyed), or retired (its payload was exported to
//! another worker and the arena index awaits reuse by `install`).
//!
//! Invariants, enforced here:
//! - every slot belongs to exactly one tag;
//! - `size_of(tag) + free_of(tag) == capacity_of(tag)`;
//! - a pinned entry (refcount > 0) is never evicted or relocated.

use crate::Tag;
use std::collections::HashMap;
use std::fmt;
use tracing::{error, trace};

const NIL: u32 = u32::MAX;

/// Stable handle to a cache slot (arena index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Resident,
    Free,
    Retired,
}

#[derive(Debug)]
struct Entry<V> {
    key: u64,
    tag: Tag,
    refcount: u32,
    prev: u32,
    next: u32,
    state: SlotState,
    value: Option<V>,
}

#[derive(Debug, Default)]
struct TagPart {
    /// Slots owned by this tag (resident + free).
    cap: usize,
    /// Resident entries, linked head (MRU) to tail (LRU).
    len: usize,
    lru_head: u32,
    lru_tail: u32,
    /// Free slots, singly linked through `next`.
    free_head: u32,
    free_len: usize,
}

impl TagPart {
    fn with_capacity(cap: usize) -> Self {
        Self {
            cap,
            len: 0,
            lru_head: NIL,
            lru_tail: NIL,
            free_head: NIL,
            free_len: 0,
        }
    }
}

/// Pool of pre-allocated slots partitioned by [`Tag`].
///
/// Single-owner: one worker thread mutates its cache; cross-worker access
/// happens only through export/install once the source has drained.
pub struct SharedCache<V> {
    entries: Vec<Entry<V>>,
    retired: Vec<u32>,
    index: HashMap<u64, u32>,
    parts: HashMap<Tag, TagPart>,
}

impl<V> SharedCache<V> {
    /// Build a pool from `(tag, capacity)` pairs, creating every slot's
    /// payload up front with `make_value`.
    pub fn new(config: &[(Tag, usize)], mut make_value: impl FnMut() -> V) -> Self {
        let total: usize = config.iter().map(|(_, c)| c).sum();
        let mut cache = Self {
            entries: Vec::with_capacity(total),
            retired: Vec::new(),
            index: HashMap::with_capacity(total),
            parts: HashMap::with_capacity(config.len()),
        };
        for &(tag, cap) in config {
            let part = cache.parts.entry(tag).or_insert_with(TagPart::default);
            part.cap += cap;
            for _ in 0..cap {
                let idx = cache.entries.len() as u32;
                cache.entries.push(Entry {
                    key: 0,
                    tag,
                    refcount: 0,
                    prev: NIL,
                    next: NIL,
                    state: SlotState::Free,
                    value: Some(make_value()),
                });
                let part = cache.parts.get_mut(&tag).expect("part just created");
                free_push(&mut cache.entries, part, idx);
            }
        }
        cache
    }

    /// Total slots across all tags.
    #[must_use]
    pub fn total_capacity(&self) -> usize {
        self.parts.values().map(|p| p.cap).sum()
    }

    #[must_use]
    pub fn capacity_of(&self, tag: Tag) -> usize {
        self.parts.get(&tag).map_or(0, |p| p.cap)
    }

    /// Resident entries of `tag`.
    #[must_use]
    pub fn size_of(&self, tag: Tag) -> usize {
        self.parts.get(&tag).map_or(0, |p| p.len)
    }

    /// Free (unkeyed) slots of `tag`.
    #[must_use]
    pub fn free_of(&self, tag: Tag) -> usize {
        self.parts.get(&tag).map_or(0, |p| p.free_len)
    }

    /// Find `key`; touches its LRU position. Does not create.
    pub fn lookup(&mut self, key: u64, pin: bool) -> Option<SlotHandle> {
        let idx = *self.index.get(&key)?;
        let tag = self.entries[idx as usize].tag;
        let part = self.parts.get_mut(&tag).expect("resident entry has a part");
        lru_unlink(&mut self.entries, part, idx);
        lru_push_front(&mut self.entries, part, idx);
        if pin {
            self.entries[idx as usize].refcount += 1;
        }
        Some(SlotHandle(idx))
    }

    /// Insert `key` under `tag`, evicting the coldest unpinned entry of
    /// that tag if it has no free slot. Returns `None` when the tag's
    /// capacity is exhausted and every resident entry is pinned.
    ///
    /// The returned slot keeps its previous payload state; the caller must
    /// observe it (e.g. unbind the old inode index) and reset it.
    pub fn insert(&mut self, tag: Tag, key: u64, pin: bool, hint_nonexist: bool) -> Option<SlotHandle> {
        if !hint_nonexist
            && let Some(handle) = self.lookup(key, pin)
        {
            return Some(handle);
        }
        debug_assert!(
            !self.index.contains_key(&key),
            "insert of already-resident key {key}"
        );

        let part = self.parts.get_mut(&tag)?;
        let idx = if let Some(idx) = free_pop(&mut self.entries, part) {
            idx
        } else {
            // Evict the coldest unpinned entry of this tag only.
            let victim = {
                let mut cursor = part.lru_tail;
                while cursor != NIL && self.entries[cursor as usize].refcount > 0 {
                    cursor = self.entries[cursor as usize].prev;
                }
                cursor
            };
            if victim == NIL {
                trace!(
                    event = "cache_insert_full",
                    tag = %tag,
                    key,
                    cap = part.cap,
                    "no evictable slot"
                );
                return None;
            }
            lru_unlink(&mut self.entries, part, victim);
            let old_key = self.entries[victim as usize].key;
            let _ = self.index.remove(&old_key);
            trace!(event = "cache_evict", tag = %tag, old_key, new_key = key);
            victim
        };

        let entry = &mut self.entries[idx as usize];
        entry.key = key;
        entry.state = SlotState::Resident;
        entry.refcount = u32::from(pin);
        let part = self.parts.get_mut(&tag).expect("checked above");
        lru_push_front(&mut self.entries, part, idx);
        self.index.insert(key, idx);
        Some(SlotHandle(idx))
    }

    /// Add a slot carrying an imported payload; grows `tag`'s capacity by
    /// one. Used on the destination side of inode migration.
    pub fn install(&mut self, tag: Tag, key: u64, value: V) -> SlotHandle {
        if self.index.contains_key(&key) {
            error!(event = "cache_install_collision", tag = %tag, key);
            panic!("install of already-resident key {key}");
        }
        let idx = if let Some(idx) = self.retired.pop() {
            let entry = &mut self.entries[idx as usize];
            debug_assert_eq!(entry.state, SlotState::Retired);
            entry.value = Some(value);
            idx
        } else {
            let idx = self.entries.len() as u32;
            self.entries.push(Entry {
                key: 0,
                tag,
                refcount: 0,
                prev: NIL,
                next: NIL,
                state: SlotState::Retired,
                value: Some(value),
            });
            idx
        };
        let entry = &mut self.entries[idx as usize];
        entry.key = key;
        entry.tag = tag;
        entry.refcount = 0;
        entry.state = SlotState::Resident;
        let part = self.parts.entry(tag).or_insert_with(TagPart::default);
        part.cap += 1;
        lru_push_front(&mut self.entries, part, idx);
        self.index.insert(key, idx);
        SlotHandle(idx)
    }

    /// Remove an entry and take its payload out of the pool (the tag's
    /// capacity shrinks by one). Fails with `None` if the entry is pinned.
    pub fn erase(&mut self, handle: SlotHandle) -> Option<V> {
        let idx = handle.0;
        let entry = &self.entries[idx as usize];
        debug_assert_eq!(entry.state, SlotState::Resident, "erase of non-resident slot");
        if entry.refcount > 0 {
            return None;
        }
        let tag = entry.tag;
        let key = entry.key;
        let part = self.parts.get_mut(&tag).expect("resident entry has a part");
        lru_unlink(&mut self.entries, part, idx);
        part.cap -= 1;
        let _ = self.index.remove(&key);
        let entry = &mut self.entries[idx as usize];
        entry.state = SlotState::Retired;
        self.retired.push(idx);
        entry.value.take()
    }

    /// Move up to `n` slots from `src` to `dst`, preferring free slots and
    /// falling back to evicting unpinned LRU-tail entries. Returns how many
    /// actually moved.
    pub fn relocate(&mut self, src: Tag, dst: Tag, n: usize) -> usize {
        if src == dst || n == 0 {
            return 0;
        }
        // Both parts must exist up front; entry API would double-borrow.
        self.parts.entry(dst).or_insert_with(TagPart::default);
        if !self.parts.contains_key(&src) {
            return 0;
        }

        let mut moved = 0;
        while moved < n {
            let src_part = self.parts.get_mut(&src).expect("checked above");
            let idx = if let Some(idx) = free_pop(&mut self.entries, src_part) {
                idx
            } else {
                let victim = {
                    let mut cursor = src_part.lru_tail;
                    while cursor != NIL && self.entries[cursor as usize].refcount > 0 {
                        cursor = self.entries[cursor as usize].prev;
                    }
                    cursor
                };
                if victim == NIL {
                    break;
                }
                lru_unlink(&mut self.entries, src_part, victim);
                let old_key = self.entries[victim as usize].key;
                let _ = self.index.remove(&old_key);
                trace!(event = "cache_relocate_evict", src = %src, dst = %dst, old_key);
                victim
            };
            let src_part = self.parts.get_mut(&src).expect("checked above");
            src_part.cap -= 1;
            let entry = &mut self.entries[idx as usize];
            entry.tag = dst;
            entry.state = SlotState::Free;
            let dst_part = self.parts.get_mut(&dst).expect("created above");
            dst_part.cap += 1;
            free_push(&mut self.entries, dst_part, idx);
            moved += 1;
        }
        moved
    }

    pub fn pin(&mut self, handle: SlotHandle) {
        self.entries[handle.0 as usize].refcount += 1;
    }

    /// Drop one reference. Panics on refcount underflow: a release without
    /// a matching pin means the caller's bookkeeping is corrupt.
    pub fn release(&mut self, handle: SlotHandle) {
        let entry = &mut self.entries[handle.0 as usize];
        if entry.refcount == 0 {
            error!(event = "cache_release_underflow", key = entry.key, tag = %entry.tag);
            panic!("release of unpinned slot for key {}", entry.key);
        }
        entry.refcount -= 1;
    }

    #[must_use]
    pub fn refcount_of(&self, handle: SlotHandle) -> u32 {
        self.entries[handle.0 as usize].refcount
    }

    #[must_use]
    pub fn key_of(&self, handle: SlotHandle) -> u64 {
        self.entries[handle.0 as usize].key
    }

    #[must_use]
    pub fn tag_of(&self, handle: SlotHandle) -> Tag {
        self.entries[handle.0 as usize].tag
    }

    #[must_use]
    pub fn value(&self, handle: SlotHandle) -> &V {
        self.entries[handle.0 as usize]
            .value
            .as_ref()
            .expect("resident slot has a payload")
    }

    pub fn value_mut(&mut self, handle: SlotHandle) -> &mut V {
        self.entries[handle.0 as usize]
            .value
            .as_mut()
            .expect("resident slot has a payload")
    }

    /// Visit every resident entry.
    pub fn for_each(&self, mut f: impl FnMut(SlotHandle, u64, Tag, &V)) {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.state == SlotState::Resident {
                f(
                    SlotHandle(i as u32),
                    entry.key,
                    entry.tag,
                    entry.value.as_ref().expect("resident slot has a payload"),
                );
            }
        }
    }
}

impl<V> fmt::Debug for SharedCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SharedCache");
        for (tag, part) in &self.parts {
            s.field(
                &tag.to_string(),
                &format_args!("cap={} len={} free={}", part.cap, part.len, part.free_len),
            );
        }
        s.finish()
    }
}

fn lru_push_front<V>(entries: &mut [Entry<V>], part: &mut TagPart, idx: u32) {
    let old_head = part.lru_head;
    {
        let entry = &mut entries[idx as usize];
        entry.prev = NIL;
        entry.next = old_head;
    }
    if old_head != NIL {
        entries[old_head as usize].prev = idx;
    } else {
        part.lru_tail = idx;
    }
    part.lru_head = idx;
    part.len += 1;
}

fn lru_unlink<V>(entries: &mut [Entry<V>], part: &mut TagPart, idx: u32) {
    let (prev, next) = {
        let entry = &entries[idx as usize];
        (entry.prev, entry.next)
    };
    if prev != NIL {
        entries[prev as usize].next = next;
    } else {
        part.lru_head = next;
    }
    if next != NIL {
        entries[next as usize].prev = prev;
    } else {
        part.lru_tail = prev;
    }
    let entry = &mut entries[idx as usize];
    entry.prev = NIL;
    entry.next = NIL;
    part.len -= 1;
}

fn free_push<V>(entries: &mut [Entry<V>], part: &mut TagPart, idx: u32) {
    entries[idx as usize].next = part.free_head;
    entries[idx as usize].prev = NIL;
    part.free_head = idx;
    part.free_len += 1;
}

fn free_pop<V>(entries: &mut [Entry<V>], part: &mut TagPart) -> Option<u32> {
    if part.free_head == NIL {
        return None;
    }
    let idx = part.free_head;
    part.free_head = entries[idx as usize].next;
    entries[idx as usize].next = NIL;
    part.free_len -= 1;
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenfs_types::AppId;

    fn tenant(aid: u32) -> Tag {
        Tag::Tenant(AppId(aid))
    }

    fn new_cache(config: &[(Tag, usize)]) -> SharedCache<u64> {
        SharedCache::new(config, || 0)
    }

    #[test]
    fn insert_and_lookup() {
        let mut cache = new_cache(&[(tenant(0), 4)]);
        let h = cache.insert(tenant(0), 1000, true, true).unwrap();
        assert_eq!(cache.key_of(h), 1000);
        assert_eq!(cache.size_of(tenant(0)), 1);
        assert_eq!(cache.lookup(1000, false), Some(h));
        assert_eq!(cache.lookup(9999, false), None);
        cache.release(h);
    }

    #[test]
    fn capacity_bound_per_tag() {
        let mut cache = new_cache(&[(tenant(0), 2), (tenant(1), 2)]);
        for key in [1, 2, 3, 4, 5] {
            cache.insert(tenant(0), key, false, true).unwrap();
            assert!(cache.size_of(tenant(0)) <= 2);
        }
        // Tenant 1 was never touched by tenant 0's churn.
        assert_eq!(cache.size_of(tenant(1)), 0);
        assert_eq!(cache.free_of(tenant(1)), 2);
        assert_eq!(cache.total_capacity(), 4);
    }

    #[test]
    fn evicts_lru_tail_only() {
        let mut cache = new_cache(&[(tenant(0), 3)]);
        for key in [10, 11, 12] {
            cache.insert(tenant(0), key, false, true).unwrap();
        }
        // Touch 10 so 11 becomes the coldest.
        cache.lookup(10, false).unwrap();
        cache.insert(tenant(0), 13, false, true).unwrap();
        assert!(cache.lookup(11, false).is_none());
        assert!(cache.lookup(10, false).is_some());
        assert!(cache.lookup(12, false).is_some());
    }

    #[test]
    fn pinned_slots_survive_eviction() {
        let mut cache = new_cache(&[(tenant(0), 2)]);
        let pinned = cache.insert(tenant(0), 1, true, true).unwrap();
        cache.insert(tenant(0), 2, false, true).unwrap();
        // 1 is the LRU tail but pinned; 2 must be the victim.
        cache.insert(tenant(0), 3, false, true).unwrap();
        assert!(cache.lookup(1, false).is_some());
        assert!(cache.lookup(2, false).is_none());
        cache.release(pinned);
    }

    #[test]
    fn full_and_fully_pinned_fails_without_mutation() {
        let mut cache = new_cache(&[(tenant(0), 2)]);
        let a = cache.insert(tenant(0), 1, true, true).unwrap();
        let b = cache.insert(tenant(0), 2, true, true).unwrap();
        assert!(cache.insert(tenant(0), 3, true, true).is_none());
        assert_eq!(cache.size_of(tenant(0)), 2);
        assert!(cache.lookup(1, false).is_some());
        assert!(cache.lookup(2, false).is_some());
        cache.release(a);
        cache.release(b);
    }

    #[test]
    fn erase_fails_on_pinned() {
        let mut cache = new_cache(&[(tenant(0), 2)]);
        let h = cache.insert(tenant(0), 1, true, true).unwrap();
        assert!(cache.erase(h).is_none());
        cache.release(h);
        assert!(cache.erase(h).is_some());
        assert_eq!(cache.capacity_of(tenant(0)), 1);
        assert!(cache.lookup(1, false).is_none());
    }

    #[test]
    fn relocate_prefers_free_then_evicts_cold() {
        let mut cache = new_cache(&[(tenant(0), 4), (Tag::Unalloc, 0)]);
        cache.insert(tenant(0), 1, false, true).unwrap();
        cache.insert(tenant(0), 2, false, true).unwrap();
        // 2 free + 2 resident; ask for 3.
        let moved = cache.relocate(tenant(0), Tag::Unalloc, 3);
        assert_eq!(moved, 3);
        assert_eq!(cache.capacity_of(tenant(0)), 1);
        assert_eq!(cache.capacity_of(Tag::Unalloc), 3);
        // The colder of the two residents was evicted.
        assert!(cache.lookup(1, false).is_none());
        assert!(cache.lookup(2, false).is_some());
    }

    #[test]
    fn relocate_stops_at_pinned() {
        let mut cache = new_cache(&[(tenant(0), 2), (Tag::Unalloc, 0)]);
        let a = cache.insert(tenant(0), 1, true, true).unwrap();
        let b = cache.insert(tenant(0), 2, true, true).unwrap();
        assert_eq!(cache.relocate(tenant(0), Tag::Unalloc, 2), 0);
        cache.release(a);
        assert_eq!(cache.relocate(tenant(0), Tag::Unalloc, 2), 1);
        cache.release(b);
    }

    #[test]
    fn erase_then_install_keeps_totals() {
        let mut cache = new_cache(&[(tenant(0), 2), (tenant(1), 2)]);
        let h = cache.insert(tenant(0), 7, false, true).unwrap();
        *cache.value_mut(h) = 42;
        let payload = cache.erase(h).unwrap();
        assert_eq!(payload, 42);
        assert_eq!(cache.capacity_of(tenant(0)), 1);

        let h2 = cache.install(tenant(1), 7, payload);
        assert_eq!(*cache.value(h2), 42);
        assert_eq!(cache.capacity_of(tenant(1)), 3);
        assert_eq!(cache.total_capacity(), 4);
    }

    #[test]
    fn for_each_visits_residents() {
        let mut cache = new_cache(&[(tenant(0), 4)]);
        for key in [1, 2, 3] {
            cache.insert(tenant(0), key, false, true).unwrap();
        }
        let mut seen = Vec::new();
        cache.for_each(|_, key, tag, _| {
            assert_eq!(tag, tenant(0));
            seen.push(key);
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
