//! Token-frame rate limiter for block submissions.
//!
//! Bandwidth is stored as its inverse, `rate_inv` cycles per block. Time
//! is bucketed into frames of [`params::CYCLES_PER_FRAME`] cycles; within
//! a frame, block `n` may go out once the frame offset reaches
//! `rate_inv * n`, which spreads permits evenly instead of bursting at
//! frame start.
//!
//! Only the owning worker calls [`RateLimiter::can_send`]; the allocator
//! thread calls [`RateLimiter::update_bandwidth`] and
//! [`RateLimiter::turn`] concurrently, hence the atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tenfs_types::params::{self, CYCLES_PER_FRAME, CYCLES_PER_SECOND, MIN_BANDWIDTH};
use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    /// Cycles per block (inverse of rate). Written by the allocator with
    /// release, read by the worker with acquire.
    rate_inv: AtomicU64,
    /// Frame bookkeeping; written only by the owning worker.
    curr_time_frame: AtomicU64,
    curr_num_blks: AtomicU64,
    is_on: AtomicBool,
}

impl RateLimiter {
    /// A minimum bandwidth is always guaranteed, even when the allocated
    /// bandwidth is zero: the floor is invisible to the allocator and
    /// cannot be traded away, so an app whose workload shifts from
    /// cache-resident to I/O-bound can still make visible progress.
    #[must_use]
    pub fn new(bandwidth: i64) -> Self {
        Self {
            rate_inv: AtomicU64::new(Self::bw_to_rate_inv(bandwidth)),
            curr_time_frame: AtomicU64::new(0),
            curr_num_blks: AtomicU64::new(0),
            is_on: AtomicBool::new(true),
        }
    }

    fn bw_to_rate_inv(bandwidth: i64) -> u64 {
        CYCLES_PER_SECOND / bandwidth.max(MIN_BANDWIDTH) as u64
    }

    fn rate_inv_to_bw(rate_inv: u64) -> u64 {
        CYCLES_PER_SECOND / rate_inv
    }

    /// Called by the allocator when a new allocation is applied.
    pub fn update_bandwidth(&self, new_bandwidth: i64) {
        self.rate_inv
            .store(Self::bw_to_rate_inv(new_bandwidth), Ordering::Release);
    }

    /// Permit at most one block per call. `now_cycles` is the worker's
    /// current cycle timestamp.
    pub fn can_send(&self, now_cycles: u64) -> bool {
        if !self.is_on.load(Ordering::Acquire) {
            return true; // happy hour: unlimited bandwidth supplied
        }
        let tf = now_cycles / CYCLES_PER_FRAME;
        let time_offset = now_cycles - tf * CYCLES_PER_FRAME;
        if tf > self.curr_time_frame.load(Ordering::Relaxed) {
            let sent = self.curr_num_blks.load(Ordering::Relaxed);
            debug!(
                event = "rate_frame_rollover",
                target_mbps = params::blocks_to_mb(Self::rate_inv_to_bw(
                    self.rate_inv.load(Ordering::Acquire)
                )),
                actual_mbps = params::blocks_to_mb(sent)
                    / (CYCLES_PER_FRAME as f64 / CYCLES_PER_SECOND as f64)
            );
            self.curr_time_frame.store(tf, Ordering::Relaxed);
            self.curr_num_blks.store(0, Ordering::Relaxed);
        }
        let sent = self.curr_num_blks.load(Ordering::Relaxed);
        let is_ok =
            time_offset >= self.rate_inv.load(Ordering::Acquire).saturating_mul(sent);
        if is_ok {
            self.curr_num_blks.store(sent + 1, Ordering::Relaxed);
        }
        is_ok
    }

    /// After publishing an allocation the allocator may briefly turn the
    /// limiter off so a tenant with newly granted cache can repopulate it
    /// quickly, then turns it back on.
    pub fn turn(&self, to_on: bool) {
        self.is_on.store(to_on, Ordering::Release);
    }

    #[must_use]
    pub fn is_on(&self) -> bool {
        self.is_on.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_min_bandwidth(&self) -> bool {
        self.rate_inv.load(Ordering::Acquire) >= CYCLES_PER_SECOND / MIN_BANDWIDTH as u64
    }
}
