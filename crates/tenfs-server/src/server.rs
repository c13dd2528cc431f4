//! Server bootstrap and teardown.
//!
//! One `Server` value owns the whole process: it builds per-worker
//! buffers and tenants from the configuration, wires the messenger and
//! the allocator's views, spawns everything, and tears it down in order
//! (allocator first, then workers, which drain and flush).

use crate::client::{ClientEndpoint, pair};
use crate::config::ServerConfig;
use crate::dev::BlockDev;
use crate::msg::Messenger;
use crate::worker::{Worker, WorkerHandle};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tenfs_buffer::BlockBuffer;
use tenfs_cache::Tag;
use tenfs_error::{Result, TenfsError};
use tenfs_sched::{Allocator, AllocatorHandle, Tenant};
use tenfs_types::{AppId, BLOCK_SIZE, WorkerId};
use tracing::info;

pub struct Server {
    workers: Vec<WorkerHandle>,
    allocator: AllocatorHandle,
    clients: HashMap<(WorkerId, AppId), ClientEndpoint>,
    ready_file: Option<std::path::PathBuf>,
    exit_file: Option<std::path::PathBuf>,
}

impl Server {
    /// Validate the configuration, build every component, and start all
    /// threads. Returns once the server is ready (and the ready file, if
    /// configured, exists).
    pub fn start(config: ServerConfig, dev: Arc<dyn BlockDev>) -> Result<Self> {
        config.validate()?;
        if let Some(ready) = &config.ready_file
            && ready.exists()
        {
            return Err(TenfsError::Config(format!(
                "ready file {} already exists",
                ready.display()
            )));
        }

        let (messenger, mut receivers) = Messenger::new(config.num_workers);

        // The allocator's views, one per app in id order, aggregating the
        // app's tenants across workers.
        let mut allocator = Allocator::new(
            config.num_workers,
            config.policy,
            config.timing,
            Arc::new(messenger.clone()),
        );

        let mut workers = Vec::with_capacity(config.num_workers);
        let mut clients = HashMap::new();
        let mut receivers_iter = receivers.drain(..);
        let mut tenants_by_app: HashMap<AppId, Vec<tenfs_sched::TenantStatHandle>> =
            HashMap::new();

        for wid in 0..config.num_workers {
            let wid = WorkerId(wid as u32);
            let grants = config.grants_for_worker(wid);

            let tags: Vec<(Tag, usize)> = if config.policy.cache_partition {
                let granted: usize = grants
                    .iter()
                    .map(|g| g.to_resrc().cache_size as usize)
                    .sum();
                grants
                    .iter()
                    .map(|g| (Tag::Tenant(g.aid), g.to_resrc().cache_size as usize))
                    .chain([(Tag::Unalloc, config.worker_cache_blocks - granted)])
                    .collect()
            } else {
                // Global LRU: one shared partition, no per-tenant slots.
                vec![(Tag::Global, config.worker_cache_blocks)]
            };
            let buffer = BlockBuffer::new_multi_tenant(
                &tags,
                BLOCK_SIZE,
                config.policy.cache_partition,
                format!("{wid}-buffer"),
            );

            let ctrl_rx = receivers_iter.next().expect("one receiver per worker");
            let mut worker = Worker::new(
                wid,
                config.policy,
                buffer,
                Arc::clone(&dev),
                ctrl_rx,
                messenger.clone(),
            );

            for grant in grants {
                let tenant = Tenant::new(wid, grant.aid, grant.to_resrc(), config.policy);
                tenants_by_app
                    .entry(grant.aid)
                    .or_default()
                    .push(tenant.stat_handle());
                let (client_end, worker_end) = pair();
                clients.insert((wid, grant.aid), client_end);
                worker.attach_app(tenant, Box::new(worker_end), Vec::new());
            }
            workers.push(worker);
        }

        for aid in 0..config.num_apps {
            let aid = AppId(aid as u32);
            let view = allocator.append_view(aid);
            let mut app_total = tenfs_sched::ResrcAlloc::default();
            if let Some(handles) = tenants_by_app.remove(&aid) {
                for handle in handles {
                    app_total += handle.init_resrc;
                    view.append_tenant(handle);
                }
            }
            allocator.add_total_resrc(app_total);
        }

        let worker_handles: Vec<WorkerHandle> = workers
            .into_iter()
            .enumerate()
            .map(|(i, worker)| WorkerHandle::spawn(worker, config.worker_cores.get(i).copied()))
            .collect();
        let allocator_handle = allocator.spawn();

        if let Some(ready) = &config.ready_file {
            std::fs::write(ready, b"ready\n")?;
            info!(event = "ready_file_created", path = %ready.display());
        }
        info!(
            event = "server_started",
            num_workers = config.num_workers,
            num_apps = config.num_apps
        );

        Ok(Self {
            workers: worker_handles,
            allocator: allocator_handle,
            clients,
            ready_file: config.ready_file,
            exit_file: config.exit_file,
        })
    }

    /// Client endpoint for one (worker, app) pair.
    #[must_use]
    pub fn client(&self, wid: WorkerId, aid: AppId) -> Option<&ClientEndpoint> {
        self.clients.get(&(wid, aid))
    }

    /// Block until the exit file appears (if one is configured).
    pub fn wait_for_exit_file(&self) {
        let Some(exit) = &self.exit_file else {
            return;
        };
        while !Path::new(exit).exists() {
            std::thread::sleep(Duration::from_millis(100));
        }
        info!(event = "exit_file_seen", path = %exit.display());
    }

    /// Stop the allocator, then the workers (each drains in-flight I/O
    /// and flushes its dirty blocks), then clean up the ready file.
    pub fn shutdown(self) {
        info!(event = "server_shutdown_begin");
        self.allocator.shutdown();
        for worker in self.workers {
            worker.shutdown();
        }
        if let Some(ready) = &self.ready_file {
            let _ = std::fs::remove_file(ready);
        }
        info!(event = "server_shutdown_done");
    }
}
