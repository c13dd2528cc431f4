//! Lightweight worker-side statistics, reported through tracing.

use tenfs_types::params::CYCLES_PER_SECOND;
use tracing::info;

/// Accumulates request latencies and reports the mean every
/// `2^19` operations (roughly every 2 GiB of block I/O).
#[derive(Debug, Default)]
pub struct LatencyStat {
    name: String,
    latency_sum_cycles: u64,
    num_ops: u64,
}

impl LatencyStat {
    const REPORT_FREQ_OPS: u64 = 1 << 19;
    const CYCLES_PER_US: u64 = CYCLES_PER_SECOND / 1_000_000;

    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency_sum_cycles: 0,
            num_ops: 0,
        }
    }

    pub fn add_latency(&mut self, cycles: u64) {
        self.latency_sum_cycles += cycles;
        self.num_ops += 1;
        if self.num_ops >= Self::REPORT_FREQ_OPS {
            info!(
                event = "latency_report",
                stat = %self.name,
                mean_us = self.latency_sum_cycles as f64
                    / Self::CYCLES_PER_US as f64
                    / self.num_ops as f64
            );
            self.latency_sum_cycles = 0;
            self.num_ops = 0;
        }
    }
}

/// Tracks what fraction of wall time a worker spends idle, reported about
/// once per second of cycle time.
#[derive(Debug)]
pub struct IdleStat {
    wid: u32,
    last_report_ts: u64,
    idle_cycles_sum: u64,
    begin_ts: u64,
}

impl IdleStat {
    const REPORT_FREQ_CYCLES: u64 = CYCLES_PER_SECOND;

    #[must_use]
    pub fn new(wid: u32) -> Self {
        Self {
            wid,
            last_report_ts: 0,
            idle_cycles_sum: 0,
            begin_ts: 0,
        }
    }

    /// Mark the start of a possibly idle window.
    pub fn start(&mut self, now_cycles: u64) {
        self.begin_ts = now_cycles;
    }

    /// Mark the end of the window begun by [`IdleStat::start`].
    pub fn stop(&mut self, now_cycles: u64) {
        let idle = now_cycles.saturating_sub(self.begin_ts);
        let since_last = now_cycles.saturating_sub(self.last_report_ts);
        if since_last > Self::REPORT_FREQ_CYCLES {
            if self.last_report_ts != 0 {
                info!(
                    event = "worker_idle_report",
                    wid = self.wid,
                    idle_pct = 100.0 * self.idle_cycles_sum as f64 / since_last as f64
                );
                self.idle_cycles_sum = 0;
            }
            self.last_report_ts = now_cycles;
        } else {
            self.idle_cycles_sum += idle;
        }
    }
}
