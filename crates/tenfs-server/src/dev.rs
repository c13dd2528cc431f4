//! Block device boundary: non-blocking submission plus completion
//! polling.
//!
//! Production SPDK/io_uring backends live outside the core; this trait is
//! what the worker loop consumes. [`MemBlockDev`] backs the tests (with a
//! configurable completion latency measured in polls, so in-flight states
//! are observable) and [`FileBlockDev`] runs against a plain file.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tenfs_error::{Result, TenfsError};
use tenfs_types::{BlockNo, BlockReqId};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevReqKind {
    Read,
    Write,
}

/// One device request. Writes carry the payload; reads get theirs back in
/// the completion.
#[derive(Debug)]
pub struct DevReq {
    pub id: BlockReqId,
    pub block_no: BlockNo,
    pub kind: DevReqKind,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct DevCompletion {
    pub id: BlockReqId,
    pub block_no: BlockNo,
    pub kind: DevReqKind,
    pub data: Option<Vec<u8>>,
}

/// Non-blocking block device interface.
pub trait BlockDev: Send + Sync {
    fn submit(&self, req: DevReq) -> Result<()>;

    /// Drain up to `max` finished requests. Never blocks.
    fn poll_completions(&self, max: usize) -> Vec<DevCompletion>;

    fn block_size(&self) -> usize;
}

/// In-memory device. Completions become visible after `latency_polls`
/// calls to `poll_completions`, defaulting to the next poll.
#[derive(Debug)]
pub struct MemBlockDev {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    inflight: Mutex<VecDeque<(usize, DevReq)>>,
    latency_polls: usize,
    block_size: usize,
}

impl MemBlockDev {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self::with_latency(block_size, 0)
    }

    #[must_use]
    pub fn with_latency(block_size: usize, latency_polls: usize) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            inflight: Mutex::new(VecDeque::new()),
            latency_polls,
            block_size,
        }
    }

    /// Pre-populate a block, bypassing the request path.
    pub fn preload(&self, block_no: BlockNo, data: Vec<u8>) {
        assert_eq!(data.len(), self.block_size);
        self.blocks.lock().insert(block_no.0, data);
    }

    /// Read back a block for assertions.
    #[must_use]
    pub fn peek(&self, block_no: BlockNo) -> Option<Vec<u8>> {
        self.blocks.lock().get(&block_no.0).cloned()
    }

    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl BlockDev for MemBlockDev {
    fn submit(&self, req: DevReq) -> Result<()> {
        if req.kind == DevReqKind::Write {
            let data = req
                .data
                .as_ref()
                .ok_or_else(|| TenfsError::Device {
                    block: req.block_no.0,
                    detail: "write without payload".to_owned(),
                })?;
            if data.len() != self.block_size {
                return Err(TenfsError::Device {
                    block: req.block_no.0,
                    detail: format!("payload size {} != block size", data.len()),
                });
            }
        }
        trace!(event = "dev_submit", id = %req.id, block = req.block_no.0, kind = ?req.kind);
        self.inflight.lock().push_back((self.latency_polls, req));
        Ok(())
    }

    fn poll_completions(&self, max: usize) -> Vec<DevCompletion> {
        let mut done = Vec::new();
        let mut inflight = self.inflight.lock();
        let mut remaining = VecDeque::with_capacity(inflight.len());
        for (mut polls_left, req) in inflight.drain(..) {
            if polls_left > 0 || done.len() >= max {
                polls_left = polls_left.saturating_sub(1);
                remaining.push_back((polls_left, req));
                continue;
            }
            let mut blocks = self.blocks.lock();
            let completion = match req.kind {
                DevReqKind::Read => {
                    let data = blocks
                        .get(&req.block_no.0)
                        .cloned()
                        .unwrap_or_else(|| vec![0_u8; self.block_size]);
                    DevCompletion {
                        id: req.id,
                        block_no: req.block_no,
                        kind: DevReqKind::Read,
                        data: Some(data),
                    }
                }
                DevReqKind::Write => {
                    let data = req.data.expect("validated at submit");
                    blocks.insert(req.block_no.0, data);
                    DevCompletion {
                        id: req.id,
                        block_no: req.block_no,
                        kind: DevReqKind::Write,
                        data: None,
                    }
                }
            };
            done.push(completion);
        }
        *inflight = remaining;
        done
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

/// File-backed device using thread-safe positional I/O; requests complete
/// synchronously and are handed back on the next poll.
#[derive(Debug)]
pub struct FileBlockDev {
    file: Arc<File>,
    completed: Mutex<VecDeque<DevCompletion>>,
    block_size: usize,
}

impl FileBlockDev {
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            completed: Mutex::new(VecDeque::new()),
            block_size,
        })
    }
}

impl BlockDev for FileBlockDev {
    fn submit(&self, req: DevReq) -> Result<()> {
        let offset = req.block_no.0 * self.block_size as u64;
        let completion = match req.kind {
            DevReqKind::Read => {
                let mut buf = vec![0_u8; self.block_size];
                self.file.read_exact_at(&mut buf, offset)?;
                DevCompletion {
                    id: req.id,
                    block_no: req.block_no,
                    kind: DevReqKind::Read,
                    data: Some(buf),
                }
            }
            DevReqKind::Write => {
                let data = req.data.ok_or_else(|| TenfsError::Device {
                    block: req.block_no.0,
                    detail: "write without payload".to_owned(),
                })?;
                self.file.write_all_at(&data, offset)?;
                DevCompletion {
                    id: req.id,
                    block_no: req.block_no,
                    kind: DevReqKind::Write,
                    data: None,
                }
            }
        };
        self.completed.lock().push_back(completion);
        Ok(())
    }

    fn poll_completions(&self, max: usize) -> Vec<DevCompletion> {
        let mut completed = self.completed.lock();
        let n = completed.len().min(max);
        completed.drain(..n).collect()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_dev_round_trip() {
        let dev = MemBlockDev::new(64);
        dev.submit(DevReq {
            id: BlockReqId(1),
            block_no: BlockNo(7),
            kind: DevReqKind::Write,
            data: Some(vec![0xAA; 64]),
        })
        .unwrap();
        let comps = dev.poll_completions(16);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].kind, DevReqKind::Write);

        dev.submit(DevReq {
            id: BlockReqId(2),
            block_no: BlockNo(7),
            kind: DevReqKind::Read,
            data: None,
        })
        .unwrap();
        let comps = dev.poll_completions(16);
        assert_eq!(comps[0].data.as_deref(), Some(&[0xAA; 64][..]));
    }

    #[test]
    fn mem_dev_latency_delays_completion() {
        let dev = MemBlockDev::with_latency(64, 2);
        dev.submit(DevReq {
            id: BlockReqId(1),
            block_no: BlockNo(1),
            kind: DevReqKind::Read,
            data: None,
        })
        .unwrap();
        assert!(dev.poll_completions(16).is_empty());
        assert!(dev.poll_completions(16).is_empty());
        assert_eq!(dev.poll_completions(16).len(), 1);
    }

    #[test]
    fn mem_dev_rejects_bad_write() {
        let dev = MemBlockDev::new(64);
        let err = dev.submit(DevReq {
            id: BlockReqId(1),
            block_no: BlockNo(1),
            kind: DevReqKind::Write,
            data: Some(vec![0; 32]),
        });
        assert!(err.is_err());
    }
}
