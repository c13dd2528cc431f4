#![forbid(unsafe_code)]
//! Multi-tenant userspace filesystem server core.
//!
//! A pool of worker threads, each running a cooperative loop that ingests
//! client requests, schedules tenants by weighted fair queueing, serves a
//! partitioned block buffer, and submits rate-limited block I/O; plus the
//! allocator thread re-partitioning cache, bandwidth, and CPU across
//! tenants and migrating inodes between workers to realize its decisions.
//!
//! Device drivers and the client transport are trait boundaries
//! ([`dev::BlockDev`], [`client::ClientChannel`]) with in-process
//! implementations for tests.

pub mod client;
pub mod config;
pub mod dev;
pub mod msg;
pub mod req;
pub mod server;
pub mod worker;
