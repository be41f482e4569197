//! Shared scaffolding for engine-level integration tests.

use std::sync::Arc;

use arbord::config::DaemonConfig;
use arbord::daemon::Engine;
use tempfile::TempDir;

/// A fresh engine rooted in a temp directory; nothing touches the host.
pub fn test_engine() -> (TempDir, Arc<Engine>) {
    let dir = TempDir::new().expect("temp dir");
    let config = DaemonConfig {
        socket_path: dir.path().join("arbord.socket"),
        default_place: dir.path().join("place"),
        state_dir: dir.path().join("state"),
        cgroup_root: dir.path().join("cgroup"),
        log_path: dir.path().join("arbord.log"),
        pidfile: dir.path().join("arbord.pid"),
        engine_pidfile: dir.path().join("arbord-engine.pid"),
        ..DaemonConfig::default()
    };
    std::fs::create_dir_all(&config.default_place).expect("place dir");
    let engine = Engine::new(config).expect("engine");
    (dir, engine)
}

pub fn current_cred() -> arbord::container::Cred {
    arbord::container::Cred::new(
        nix::unistd::Uid::current().as_raw(),
        nix::unistd::Gid::current().as_raw(),
    )
}
