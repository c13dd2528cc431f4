#![forbid(unsafe_code)]
//! Tag-partitioned shared LRU cache and sampled ghost cache.
//!
//! [`SharedCache`] manages a fixed pool of slots where every slot is owned
//! by exactly one [`Tag`]; each tag gets its own LRU list, capacity, and
//! pin accounting, and slots move between tags only through explicit
//! [`SharedCache::relocate`] calls (or export/install during inode
//! migration).
//!
//! [`SampledGhostCache`] estimates, for a sweep of hypothetical cache
//! sizes, the hit/miss counts a plain LRU of each size would have observed
//! — without allocating that memory. Its counters live in a shared
//! [`GhostCurve`] so the allocator thread can read them while the owning
//! worker keeps writing.

use std::fmt;
use tenfs_types::AppId;

mod ghost;
mod shared;

pub use ghost::{AccessMode, GhostCurve, SampledGhostCache};
pub use shared::{SharedCache, SlotHandle};

/// Owner of a cache slot.
///
/// `Unalloc` holds the free pool, `Global` holds un-partitioned slots
/// (when cache partitioning is off), and `Tenant` carries the app id of a
/// real tenant — a stable key rather than a pointer, so handles survive
/// inode migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Unalloc,
    Global,
    Tenant(AppId),
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unalloc => write!(f, "UNALLOC"),
            Self::Global => write!(f, "GLOBAL"),
            Self::Tenant(aid) => write!(f, "{aid}"),
        }
    }
}

/// Hit/miss counters for one candidate cache size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStat {
    pub hit_cnt: u64,
    pub miss_cnt: u64,
}

impl fmt::Display for CacheStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[hit={},miss={}]", self.hit_cnt, self.miss_cnt)
    }
}

/// Mix a 64-bit page id for sampling decisions.
///
/// FNV-1a-like: multiply by a large prime, XOR-fold the halves.
#[must_use]
#[inline]
pub(crate) fn mix64(x: u64) -> u64 {
    let mixed = x.wrapping_mul(0x517c_c1b7_2722_0a95);
    mixed ^ (mixed >> 32)
}
