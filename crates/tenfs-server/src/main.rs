#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tenfs_server::config::{ServerConfig, TenantGrant};
use tenfs_server::dev::{BlockDev, FileBlockDev, MemBlockDev};
use tenfs_server::server::Server;
use tenfs_types::{AllocTiming, BLOCK_SIZE, Policy};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Multi-tenant userspace filesystem server.
#[derive(Parser, Debug)]
#[command(name = "tenfs-server", version)]
struct Cli {
    /// Number of worker threads to create.
    #[arg(short = 'w', long = "workers")]
    num_workers: usize,

    /// Number of apps that will attach.
    #[arg(short = 'a', long = "apps")]
    num_apps: usize,

    /// Comma-separated list of cores to pin workers on; length must match
    /// the worker count. Pinning is advisory (thread naming).
    #[arg(short = 'c', long = "cores", value_delimiter = ',')]
    cores: Vec<usize>,

    /// Comma-separated tenant grants, each formatted as "wX-aY:cZ:bW:pV"
    /// (worker X, app Y, cache Z MiB, bandwidth W MiB/s, CPU ratio V).
    #[arg(short = 'l', long = "grants", value_delimiter = ',')]
    grants: Vec<String>,

    /// Ready-signal file; must not exist at start, created when ready.
    #[arg(short = 'r', long = "ready-file")]
    ready_file: Option<PathBuf>,

    /// Exit-signal file; its appearance asks the server to shut down.
    #[arg(short = 'e', long = "exit-file")]
    exit_file: Option<PathBuf>,

    /// Filesystem config file (external format; `f` for filesystem).
    #[arg(short = 'f', long = "fs-config")]
    fs_config: Option<PathBuf>,

    /// Device config file (`d` for device). If it names an image path on
    /// its first line, the server runs on that file; otherwise in memory.
    #[arg(short = 'd', long = "dev-config")]
    dev_config: Option<PathBuf>,

    /// Comma-separated policy flags: NO_ALLOC, NO_HARVEST,
    /// NO_SYMM_PARTITION, NO_AVOID_TINY_WEIGHT, NO_CACHE_PARTITION.
    #[arg(short = 'p', long = "policy", value_delimiter = ',')]
    policy: Vec<String>,

    /// Slot-pool capacity per worker, in blocks.
    #[arg(long = "worker-cache-blocks", default_value_t = 262_144)]
    worker_cache_blocks: usize,
}

fn build_config(cli: &Cli) -> Result<ServerConfig> {
    let mut policy = Policy::default();
    for flag in &cli.policy {
        policy
            .apply_flag(flag)
            .with_context(|| format!("bad -p flag {flag}"))?;
    }

    let mut grants = Vec::with_capacity(cli.grants.len());
    for item in &cli.grants {
        grants.push(TenantGrant::parse(item).with_context(|| format!("bad -l item {item}"))?);
    }
    if grants.is_empty() {
        // Legal, e.g. a no-scheduling smoke run, but worth flagging.
        eprintln!("warning: no tenant grants specified; no app resources are limited");
    }

    if let Some(ready) = &cli.ready_file
        && ready.exists()
    {
        bail!("ready file {} already exists", ready.display());
    }
    if let Some(exit) = &cli.exit_file
        && exit.exists()
    {
        bail!("exit file {} already exists", exit.display());
    }
    if let Some(fs_config) = &cli.fs_config
        && !fs_config.exists()
    {
        bail!("fs config {} does not exist", fs_config.display());
    }
    if let Some(dev_config) = &cli.dev_config
        && !dev_config.exists()
    {
        bail!("device config {} does not exist", dev_config.display());
    }

    let config = ServerConfig {
        num_workers: cli.num_workers,
        num_apps: cli.num_apps,
        worker_cores: cli.cores.clone(),
        grants,
        policy,
        timing: AllocTiming::default(),
        worker_cache_blocks: cli.worker_cache_blocks,
        ready_file: cli.ready_file.clone(),
        exit_file: cli.exit_file.clone(),
    };
    config.validate()?;
    Ok(config)
}

fn open_device(cli: &Cli) -> Result<Arc<dyn BlockDev>> {
    if let Some(dev_config) = &cli.dev_config {
        let contents = std::fs::read_to_string(dev_config)
            .with_context(|| format!("reading {}", dev_config.display()))?;
        if let Some(image) = contents.lines().next().map(str::trim)
            && !image.is_empty()
        {
            info!(event = "device_image", path = image);
            return Ok(Arc::new(FileBlockDev::open(image, BLOCK_SIZE)?));
        }
    }
    info!(event = "device_in_memory");
    Ok(Arc::new(MemBlockDev::new(BLOCK_SIZE)))
}

fn run() -> Result<()> {
    // A usage error is a configuration error: exit 1, not clap's 2.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().expect("writing clap diagnostics");
            std::process::exit(1);
        }
    };
    let config = build_config(&cli)?;
    let dev = open_device(&cli)?;

    let server = Server::start(config, dev)?;
    server.wait_for_exit_file();
    server.shutdown();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
