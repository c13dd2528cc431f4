#![forbid(unsafe_code)]
//! Multi-tenant block buffer.
//!
//! [`BlockBuffer`] maps block numbers to cache slots through a
//! tag-partitioned [`tenfs_cache::SharedCache`], tracks which slots belong
//! to which inode, and delegates dirty accounting and flush pacing to the
//! [`Flusher`]. It also implements the export/install halves of inode
//! migration between workers.

mod buffer;
mod flusher;
mod slot;

pub use buffer::{BlockBuffer, CacheClient, ExportedSlot};
pub use flusher::{FlushBatch, Flusher, TenantFlushInfo};
pub use slot::{BlockData, BufferSlot};
