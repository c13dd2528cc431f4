#![forbid(unsafe_code)]
//! Error types for tenfs.
//!
//! Defines `TenfsError` and a `Result<T>` alias used throughout the
//! workspace. Resource exhaustion (a full, fully-pinned cache partition) is
//! deliberately *not* an error: those paths return `None` and the caller
//! backs off. Corrupt bookkeeping is not an error either: workers abort,
//! because the system is not designed to recover from a corrupt cache.

use thiserror::Error;

/// Unified error type for fallible tenfs operations.
#[derive(Debug, Error)]
pub enum TenfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("control channel to {peer} is closed")]
    ChannelClosed { peer: String },

    #[error("device rejected request for block {block}: {detail}")]
    Device { block: u64, detail: String },

    #[error("flush completion signaled but no flush was in flight")]
    NoFlushInFlight,

    #[error("unknown app {aid} on worker {wid}")]
    UnknownApp { aid: u32, wid: u32 },
}

/// Result alias using `TenfsError`.
pub type Result<T> = std::result::Result<T, TenfsError>;
