//! arbord - a privileged Linux container management daemon.
//!
//! A supervised engine process owns a hierarchical tree of containers
//! (cgroups, namespaces, layered root filesystems) and a set of volumes,
//! and serves RPC requests over a local stream socket. The engine runs an
//! epoll loop on one I/O thread, a due-time event queue on a worker
//! thread, and a fixed pool of request workers.

pub mod cgroup;
pub mod client;
pub mod config;
pub mod container;
pub mod daemon;
pub mod events;
pub mod helpers;
pub mod kv;
pub mod net;
pub mod rpc;
pub mod stats;
pub mod storage;
pub mod util;
pub mod volume;
pub mod waiter;

pub use arbor_shared::{ArborError, ArborResult, ErrorKind};

/// Daemon version reported over RPC and by `arbord version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable forced into every container payload so userspace
/// inside can detect containerization.
pub const CONTAINER_ENV_VAR: &str = "container";
pub const CONTAINER_ENV_VALUE: &str = "arbor";

/// Milliseconds since the unix epoch, monotonic enough for event due-times.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
