//! Server configuration: per-tenant resource grants and global settings.
//!
//! The command line expresses grants as `wX-aY:cZ:bW:pV` items — worker
//! `X`, app `Y`, initial cache in MiB, bandwidth in MiB/s, and CPU ratio
//! of one worker. All bounds are validated up front, before any thread
//! starts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tenfs_error::{Result, TenfsError};
use tenfs_sched::ResrcAlloc;
use tenfs_types::params::{CYCLES_PER_SECOND, mb_to_blocks};
use tenfs_types::{AllocTiming, AppId, Policy, WorkerId};

/// One (worker, app) resource grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantGrant {
    pub wid: WorkerId,
    pub aid: AppId,
    pub cache_mb: u32,
    pub bandwidth_mbps: f64,
    /// Fraction of one worker's CPU, in (0, 1].
    pub cpu_ratio: f64,
}

impl TenantGrant {
    /// Parse one `wX-aY:cZ:bW:pV` item.
    pub fn parse(item: &str) -> Result<Self> {
        let bad = || TenfsError::Config(format!("invalid tenant grant: {item}"));
        let mut parts = item.split(':');
        let ids = parts.next().ok_or_else(bad)?;
        let (w_part, a_part) = ids.split_once('-').ok_or_else(bad)?;
        let wid = w_part.strip_prefix('w').ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let aid = a_part.strip_prefix('a').ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let cache_mb = parts
            .next()
            .and_then(|s| s.strip_prefix('c'))
            .ok_or_else(bad)?
            .parse()
            .map_err(|_| bad())?;
        let bandwidth_mbps = parts
            .next()
            .and_then(|s| s.strip_prefix('b'))
            .ok_or_else(bad)?
            .parse()
            .map_err(|_| bad())?;
        let cpu_ratio: f64 = parts
            .next()
            .and_then(|s| s.strip_prefix('p'))
            .ok_or_else(bad)?
            .parse()
            .map_err(|_| bad())?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            wid: WorkerId(wid),
            aid: AppId(aid),
            cache_mb,
            bandwidth_mbps,
            cpu_ratio,
        })
    }

    /// Convert to the core's units: blocks, blocks/s, cycles/s.
    #[must_use]
    pub fn to_resrc(&self) -> ResrcAlloc {
        ResrcAlloc {
            cache_size: mb_to_blocks(self.cache_mb),
            bandwidth: (self.bandwidth_mbps * 256.0) as i64,
            cpu_cycles: (self.cpu_ratio * CYCLES_PER_SECOND as f64) as i64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_workers: usize,
    pub num_apps: usize,
    /// Advisory core assignment, one entry per worker.
    pub worker_cores: Vec<usize>,
    pub grants: Vec<TenantGrant>,
    pub policy: Policy,
    pub timing: AllocTiming,
    /// Slot-pool capacity per worker, in blocks.
    pub worker_cache_blocks: usize,
    pub ready_file: Option<PathBuf>,
    pub exit_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Check every bound before anything starts.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(TenfsError::Config("no valid num_workers specified".into()));
        }
        if self.num_apps == 0 {
            return Err(TenfsError::Config("no valid num_apps specified".into()));
        }
        if self.worker_cores.len() != self.num_workers {
            return Err(TenfsError::Config(
                "num_workers and core list length mismatch".into(),
            ));
        }
        self.timing
            .validate()
            .map_err(|e| TenfsError::Config(e.to_string()))?;
        let mut per_worker_cache = vec![0_usize; self.num_workers];
        for grant in &self.grants {
            if grant.wid.index() >= self.num_workers {
                return Err(TenfsError::Config(format!(
                    "worker {} does not exist",
                    grant.wid
                )));
            }
            if grant.aid.0 as usize >= self.num_apps {
                return Err(TenfsError::Config(format!("app {} does not exist", grant.aid)));
            }
            if !(grant.cpu_ratio > 0.0 && grant.cpu_ratio <= 1.0) {
                return Err(TenfsError::Config(format!(
                    "CPU ratio must be in (0, 1]: {}",
                    grant.cpu_ratio
                )));
            }
            // `cache_mb: u32` rejects negatives at parse time, but a
            // negative (or NaN) bandwidth parses fine as f64.
            if !(grant.bandwidth_mbps > 0.0) {
                return Err(TenfsError::Config(format!(
                    "bandwidth must be positive: {}",
                    grant.bandwidth_mbps
                )));
            }
            per_worker_cache[grant.wid.index()] += mb_to_blocks(grant.cache_mb) as usize;
        }
        for (wid, &used) in per_worker_cache.iter().enumerate() {
            if used > self.worker_cache_blocks {
                return Err(TenfsError::Config(format!(
                    "worker {wid}: granted cache ({used} blocks) exceeds the pool \
                     ({} blocks)",
                    self.worker_cache_blocks
                )));
            }
        }
        // The allocator partitions each app's weight across all workers;
        // every app therefore needs exactly one grant per worker.
        if !self.grants.is_empty() {
            let mut seen = vec![vec![false; self.num_workers]; self.num_apps];
            for grant in &self.grants {
                let cell = &mut seen[grant.aid.0 as usize][grant.wid.index()];
                if *cell {
                    return Err(TenfsError::Config(format!(
                        "duplicate grant for {}-{}",
                        grant.wid, grant.aid
                    )));
                }
                *cell = true;
            }
            for (aid, workers) in seen.iter().enumerate() {
                if workers.iter().any(|covered| !covered) {
                    return Err(TenfsError::Config(format!(
                        "app {aid} must have a grant on every worker"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Grants targeting one worker.
    #[must_use]
    pub fn grants_for_worker(&self, wid: WorkerId) -> Vec<&TenantGrant> {
        self.grants.iter().filter(|g| g.wid == wid).collect()
    }

    /// Grants for one app, ordered by worker id.
    #[must_use]
    pub fn grants_for_app(&self, aid: AppId) -> Vec<&TenantGrant> {
        let mut grants: Vec<&TenantGrant> =
            self.grants.iter().filter(|g| g.aid == aid).collect();
        grants.sort_by_key(|g| g.wid);
        grants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grant_items() {
        let grant = TenantGrant::parse("w0-a1:c64:b100:p0.5").unwrap();
        assert_eq!(grant.wid, WorkerId(0));
        assert_eq!(grant.aid, AppId(1));
        assert_eq!(grant.cache_mb, 64);
        assert!((grant.bandwidth_mbps - 100.0).abs() < 1e-9);
        assert!((grant.cpu_ratio - 0.5).abs() < 1e-9);

        let resrc = grant.to_resrc();
        assert_eq!(resrc.cache_size, 64 * 256);
        assert_eq!(resrc.bandwidth, 25_600);
        assert_eq!(resrc.cpu_cycles, (CYCLES_PER_SECOND / 2) as i64);
    }

    #[test]
    fn rejects_malformed_grants() {
        for bad in [
            "",
            "w0a0:c1:b1:p1",
            "w0-a0:c1:b1",
            "w0-a0:x1:b1:p1",
            "w0-a0:c1:b1:p1:extra",
            "wx-a0:c1:b1:p1",
        ] {
            assert!(TenantGrant::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    fn base_config() -> ServerConfig {
        ServerConfig {
            num_workers: 2,
            num_apps: 2,
            worker_cores: vec![0, 1],
            grants: vec![
                TenantGrant::parse("w0-a0:c16:b50:p0.5").unwrap(),
                TenantGrant::parse("w1-a0:c16:b50:p0.5").unwrap(),
                TenantGrant::parse("w0-a1:c16:b50:p0.5").unwrap(),
                TenantGrant::parse("w1-a1:c16:b50:p0.5").unwrap(),
            ],
            policy: Policy::default(),
            timing: AllocTiming::default(),
            worker_cache_blocks: 16_384,
            ready_file: None,
            exit_file: None,
        }
    }

    #[test]
    fn validates_bounds_up_front() {
        base_config().validate().unwrap();

        let mut config = base_config();
        config.grants.push(TenantGrant::parse("w5-a0:c1:b1:p0.1").unwrap());
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.grants[0].cpu_ratio = 1.5;
        assert!(config.validate().is_err());

        // A negative bandwidth parses (f64) but must not validate.
        let mut config = base_config();
        config.grants[0] = TenantGrant::parse("w0-a0:c16:b-5:p0.5").unwrap();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.grants[0].bandwidth_mbps = 0.0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.worker_cores = vec![0];
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.worker_cache_blocks = 1024;
        assert!(config.validate().is_err());

        // Every app must be granted on every worker.
        let mut config = base_config();
        config.grants.pop();
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.grants.push(TenantGrant::parse("w0-a0:c1:b1:p0.1").unwrap());
        assert!(config.validate().is_err(), "duplicate grant must be rejected");
    }
}
