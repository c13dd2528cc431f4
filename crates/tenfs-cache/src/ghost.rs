//! Sampled ghost cache: hit-rate curves for hypothetical cache sizes.
//!
//! Maintains one LRU ordering of (a sampled subset of) accessed pages and,
//! for each candidate size in `[min_size, max_size]` step `tick`, the
//! hit/miss counts a plain LRU of that size would have observed. A hit at
//! LRU depth `d` is a hit for every candidate size `>= d`, so one counter
//! per tick bucket suffices; `get_stat` sums the prefix.
//!
//! Depth is tracked in O(num_ticks) per access: every node carries its
//! bucket, and per-tick boundary cursors are nudged when a node moves to
//! the front. Sampling is by hash prefix so the write amplification on hot
//! paths stays negligible.
//!
//! The counters live in a shared [`GhostCurve`] (release stores, acquire
//! loads): the owning worker writes, the allocator reads. Readers may see
//! a torn sweep; inclusiveness is re-clamped on the read side.

use crate::{CacheStat, mix64};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const NIL: u32 = u32::MAX;

/// How an access should be counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Default,
    /// Count as a miss regardless of depth. Used for writes, which consume
    /// write bandwidth whether or not the page is resident.
    AsMiss,
}

/// Shared, read-only view of the ghost counters.
///
/// Counts are in sampled units; consumers only form ratios, so the sample
/// rate cancels out.
#[derive(Debug)]
pub struct GhostCurve {
    min_size: u32,
    max_size: u32,
    tick: u32,
    hits: Vec<AtomicU64>,
    accesses: AtomicU64,
}

impl GhostCurve {
    #[must_use]
    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    #[must_use]
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    #[must_use]
    pub fn tick(&self) -> u32 {
        self.tick
    }

    #[must_use]
    pub fn num_ticks(&self) -> usize {
        self.hits.len()
    }

    /// Hit/miss counts an LRU of `size` blocks would have observed.
    ///
    /// `size` is clamped into the sweep and rounded down to a tick.
    #[must_use]
    pub fn get_stat(&self, size: u32) -> CacheStat {
        let clamped = size.clamp(self.min_size, self.max_size);
        let k = ((clamped - self.min_size) / self.tick) as usize;
        // Sum hits before loading the access total: the release/acquire
        // pair guarantees every counted hit's access is visible, keeping
        // miss_cnt non-negative under concurrent writes.
        let hit_cnt: u64 = self.hits[..=k]
            .iter()
            .map(|h| h.load(Ordering::Acquire))
            .sum();
        let miss_cnt = self.accesses.load(Ordering::Acquire).saturating_sub(hit_cnt);
        CacheStat { hit_cnt, miss_cnt }
    }
}

#[derive(Debug)]
struct Node {
    page: u64,
    prev: u32,
    next: u32,
    /// Which tick region this node currently sits in (0 = hottest).
    bucket: u16,
}

/// Ghost cache over a hash-sampled subset of accesses.
///
/// Owned and mutated by one worker; the allocator observes it through
/// [`SampledGhostCache::curve`].
#[derive(Debug)]
pub struct SampledGhostCache {
    curve: Arc<GhostCurve>,
    sample_shift: u32,
    /// Scaled LRU positions of the tick boundaries (1-based).
    positions: Vec<u32>,
    /// Node index at each boundary position; NIL while the list is shorter.
    boundaries: Vec<u32>,
    nodes: Vec<Node>,
    free: Vec<u32>,
    map: HashMap<u64, u32>,
    head: u32,
    tail: u32,
    len: u32,
}

impl SampledGhostCache {
    /// Default sampling: 1 in 32 pages.
    pub const DEFAULT_SAMPLE_SHIFT: u32 = 5;

    #[must_use]
    pub fn new(tick: u32, min_size: u32, max_size: u32) -> Self {
        Self::with_sample_shift(tick, min_size, max_size, Self::DEFAULT_SAMPLE_SHIFT)
    }

    /// `sample_shift = 0` samples every access (used by tests).
    #[must_use]
    pub fn with_sample_shift(tick: u32, min_size: u32, max_size: u32, sample_shift: u32) -> Self {
        assert!(tick > 0 && min_size > 0, "ghost sweep must be non-empty");
        assert!(
            max_size >= min_size && (max_size - min_size) % tick == 0,
            "ghost sweep bounds must differ by a multiple of tick"
        );
        assert!(
            tick >> sample_shift > 0 && min_size >> sample_shift > 0,
            "sample rate too coarse for the sweep geometry"
        );
        let num_ticks = ((max_size - min_size) / tick + 1) as usize;
        let scaled_min = min_size >> sample_shift;
        let scaled_tick = tick >> sample_shift;
        let positions = (0..num_ticks)
            .map(|i| scaled_min + i as u32 * scaled_tick)
            .collect::<Vec<_>>();
        let capacity = positions[num_ticks - 1];
        Self {
            curve: Arc::new(GhostCurve {
                min_size,
                max_size,
                tick,
                hits: (0..num_ticks).map(|_| AtomicU64::new(0)).collect(),
                accesses: AtomicU64::new(0),
            }),
            sample_shift,
            positions,
            boundaries: vec![NIL; num_ticks],
            nodes: Vec::with_capacity(capacity as usize),
            free: Vec::new(),
            map: HashMap::with_capacity(capacity as usize),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Shared counter view for cross-thread readers.
    #[must_use]
    pub fn curve(&self) -> Arc<GhostCurve> {
        Arc::clone(&self.curve)
    }

    #[must_use]
    pub fn get_stat(&self, size: u32) -> CacheStat {
        self.curve.get_stat(size)
    }

    /// Record one access. Non-sampled pages are ignored entirely.
    pub fn access(&mut self, page_id: u64, mode: AccessMode) {
        if mix64(page_id) & ((1 << self.sample_shift) - 1) != 0 {
            return;
        }
        self.curve.accesses.fetch_add(1, Ordering::Release);

        if let Some(&idx) = self.map.get(&page_id) {
            let bucket = self.nodes[idx as usize].bucket;
            if mode == AccessMode::Default {
                self.curve.hits[bucket as usize].fetch_add(1, Ordering::Release);
            }
            self.move_to_front(idx, bucket);
        } else {
            self.insert_front(page_id);
        }
    }

    /// Nudge boundary `i` one step toward the head: the node that was at
    /// the boundary position is now one deeper, in region `i + 1`.
    fn shift_boundary(&mut self, i: usize) {
        let old = self.boundaries[i];
        debug_assert_ne!(old, NIL, "shifted boundary must exist");
        self.nodes[old as usize].bucket = (i + 1) as u16;
        self.boundaries[i] = self.nodes[old as usize].prev;
    }

    fn move_to_front(&mut self, idx: u32, bucket: u16) {
        if self.head == idx {
            return;
        }
        // Nodes above the accessed one sink by one position, dragging the
        // shallower boundaries with them.
        for i in 0..bucket as usize {
            self.shift_boundary(i);
        }
        if self.boundaries[bucket as usize] == idx {
            self.boundaries[bucket as usize] = self.nodes[idx as usize].prev;
        }
        self.unlink(idx);
        self.push_front(idx);
        self.nodes[idx as usize].bucket = 0;
    }

    fn insert_front(&mut self, page_id: u64) {
        // Boundaries always form a prefix of the sweep; every existing one
        // sinks by one position.
        for i in 0..self.boundaries.len() {
            if self.boundaries[i] == NIL {
                break;
            }
            self.shift_boundary(i);
        }

        let idx = if let Some(idx) = self.free.pop() {
            let node = &mut self.nodes[idx as usize];
            node.page = page_id;
            node.bucket = 0;
            idx
        } else {
            let idx = self.nodes.len() as u32;
            self.nodes.push(Node {
                page: page_id,
                prev: NIL,
                next: NIL,
                bucket: 0,
            });
            idx
        };
        self.push_front(idx);
        self.map.insert(page_id, idx);
        self.len += 1;

        let capacity = self.positions[self.positions.len() - 1];
        if self.len > capacity {
            let victim = self.tail;
            self.unlink(victim);
            let page = self.nodes[victim as usize].page;
            let _ = self.map.remove(&page);
            self.free.push(victim);
            self.len -= 1;
        }

        // The list may have just grown across a boundary position; the
        // node sitting exactly there is the tail.
        for i in 0..self.boundaries.len() {
            if self.boundaries[i] == NIL && self.len >= self.positions[i] {
                self.boundaries[i] = self.tail;
            }
        }
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[idx as usize];
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.nodes[old_head as usize].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let node = &self.nodes[idx as usize];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Plain LRU used as the reference model.
    struct RefLru {
        size: usize,
        pages: Vec<u64>,
        hits: u64,
    }

    impl RefLru {
        fn new(size: usize) -> Self {
            Self {
                size,
                pages: Vec::new(),
                hits: 0,
            }
        }

        fn access(&mut self, page: u64, count_hit: bool) {
            if let Some(pos) = self.pages.iter().position(|&p| p == page) {
                self.pages.remove(pos);
                if count_hit {
                    self.hits += 1;
                }
            } else if self.pages.len() == self.size {
                self.pages.pop();
            }
            self.pages.insert(0, page);
        }
    }

    fn workload(seed: u64, len: usize, universe: u64) -> Vec<u64> {
        // xorshift64 keeps the trace deterministic without a rand dep.
        let mut state = seed;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state % universe
            })
            .collect()
    }

    #[test]
    fn matches_reference_lru_at_every_tick() {
        let (tick, min, max) = (2, 2, 12);
        let mut ghost = SampledGhostCache::with_sample_shift(tick, min, max, 0);
        let sizes: Vec<u32> = (0..6).map(|i| min + i * tick).collect();
        let mut refs: Vec<RefLru> = sizes.iter().map(|&s| RefLru::new(s as usize)).collect();

        for page in workload(42, 4000, 20) {
            ghost.access(page, AccessMode::Default);
            for r in &mut refs {
                r.access(page, true);
            }
        }

        for (i, &size) in sizes.iter().enumerate() {
            let stat = ghost.get_stat(size);
            assert_eq!(
                stat.hit_cnt, refs[i].hits,
                "size {size}: ghost and reference LRU disagree"
            );
            assert_eq!(stat.hit_cnt + stat.miss_cnt, 4000);
        }
    }

    #[test]
    fn curve_is_inclusive() {
        let mut ghost = SampledGhostCache::with_sample_shift(4, 4, 32, 0);
        for page in workload(7, 10_000, 64) {
            ghost.access(page, AccessMode::Default);
        }
        let mut prev = ghost.get_stat(4);
        for size in (8..=32).step_by(4) {
            let curr = ghost.get_stat(size as u32);
            assert!(curr.hit_cnt >= prev.hit_cnt, "hit count must not shrink");
            assert!(curr.miss_cnt <= prev.miss_cnt, "miss count must not grow");
            prev = curr;
        }
    }

    #[test]
    fn as_miss_counts_as_miss_at_any_depth() {
        let mut ghost = SampledGhostCache::with_sample_shift(2, 2, 8, 0);
        for _ in 0..100 {
            ghost.access(1, AccessMode::AsMiss);
        }
        let stat = ghost.get_stat(8);
        assert_eq!(stat.hit_cnt, 0);
        assert_eq!(stat.miss_cnt, 100);
    }

    #[test]
    fn reads_mix_with_forced_misses() {
        let mut ghost = SampledGhostCache::with_sample_shift(2, 2, 8, 0);
        ghost.access(1, AccessMode::Default); // miss
        ghost.access(1, AccessMode::Default); // hit at depth 1
        ghost.access(1, AccessMode::AsMiss); // forced miss, still re-ranked
        ghost.access(1, AccessMode::Default); // hit again
        let stat = ghost.get_stat(2);
        assert_eq!(stat.hit_cnt, 2);
        assert_eq!(stat.miss_cnt, 2);
    }

    #[test]
    fn sampling_skips_most_pages() {
        let mut ghost = SampledGhostCache::with_sample_shift(256, 256, 1024, 5);
        for page in 0..10_000_u64 {
            ghost.access(page, AccessMode::Default);
        }
        let stat = ghost.get_stat(1024);
        let total = stat.hit_cnt + stat.miss_cnt;
        // Expect roughly 1/32 of accesses to be sampled.
        assert!(total > 100 && total < 1000, "sampled {total} of 10000");
    }

    #[test]
    fn curve_readable_through_shared_handle() {
        let mut ghost = SampledGhostCache::with_sample_shift(2, 2, 8, 0);
        let curve = ghost.curve();
        ghost.access(5, AccessMode::Default);
        ghost.access(5, AccessMode::Default);
        let stat = curve.get_stat(8);
        assert_eq!(stat.hit_cnt, 1);
        assert_eq!(stat.miss_cnt, 1);
    }
}
