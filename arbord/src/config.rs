//! Daemon configuration.
//!
//! A JSON file with defaulted sections; every field has a sane default
//! so an absent or empty file yields a working daemon.

use std::path::{Path, PathBuf};

use arbor_shared::{ArborError, ArborResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/arbord/arbord.conf";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listening socket path.
    pub socket_path: PathBuf,
    /// Group owning the socket; 0 keeps root.
    pub socket_group: u32,
    /// Socket mode bits.
    pub socket_mode: u32,
    /// Request worker threads.
    pub workers: usize,
    pub max_clients: usize,
    pub max_clients_per_container: usize,
    pub max_containers: u32,
    /// Default place hosting porto_volumes / porto_layers / porto_storage.
    pub default_place: PathBuf,
    /// State directory with the container and volume KV trees.
    pub state_dir: PathBuf,
    /// Cgroup filesystem root.
    pub cgroup_root: PathBuf,
    pub log_path: PathBuf,
    pub pidfile: PathBuf,
    pub engine_pidfile: PathBuf,
    /// Default graceful-stop budget, ms.
    pub stop_timeout_ms: u64,
    /// Helper process budget, ms.
    pub helper_timeout_ms: u64,
    /// Log rotation cadence, ms.
    pub rotate_logs_interval_ms: u64,
    /// Weak layer sweep cadence, ms.
    pub layer_sweep_interval_ms: u64,
    /// Weak layers idle beyond this are swept, ms.
    pub layer_max_idle_ms: u64,
    pub network_watchdog_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/arbord.socket"),
            socket_group: 0,
            socket_mode: 0o666,
            workers: 4,
            max_clients: 1024,
            max_clients_per_container: 256,
            max_containers: crate::container::DEFAULT_MAX_CONTAINERS,
            default_place: PathBuf::from("/place"),
            state_dir: PathBuf::from("/run/arbord"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            log_path: PathBuf::from("/var/log/arbord.log"),
            pidfile: PathBuf::from("/run/arbord.pid"),
            engine_pidfile: PathBuf::from("/run/arbord-engine.pid"),
            stop_timeout_ms: 30_000,
            helper_timeout_ms: 300_000,
            rotate_logs_interval_ms: 60_000,
            layer_sweep_interval_ms: 3_600_000,
            layer_max_idle_ms: 7 * 24 * 3_600_000,
            network_watchdog_interval_ms: 60_000,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> ArborResult<DaemonConfig> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DaemonConfig::default())
            }
            Err(e) => return Err(ArborError::from(e).context(format!("reading {}", path.display()))),
        };
        let config: DaemonConfig = serde_json::from_str(&content).map_err(|e| {
            ArborError::invalid_data(format!("config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ArborResult<()> {
        if self.workers == 0 {
            return Err(ArborError::invalid_value("workers must be at least 1"));
        }
        if !self.default_place.is_absolute() {
            return Err(ArborError::invalid_value("default_place must be absolute"));
        }
        if self.max_containers == 0 {
            return Err(ArborError::invalid_value("max_containers must be positive"));
        }
        Ok(())
    }

    pub fn container_kv_dir(&self) -> PathBuf {
        self.state_dir.join("containers")
    }

    pub fn volume_kv_dir(&self) -> PathBuf {
        self.state_dir.join("volumes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = DaemonConfig::load(Path::new("/definitely/not/here.conf")).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.socket_path, PathBuf::from("/run/arbord.socket"));
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arbord.conf");
        std::fs::write(&path, r#"{ "workers": 8, "default_place": "/fast" }"#).unwrap();
        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.default_place, PathBuf::from("/fast"));
        // Untouched fields keep their defaults.
        assert_eq!(config.max_clients, 1024);
    }

    #[test]
    fn test_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arbord.conf");
        std::fs::write(&path, r#"{ "workers": 0 }"#).unwrap();
        assert!(DaemonConfig::load(&path).is_err());
        std::fs::write(&path, r#"{ "default_place": "relative" }"#).unwrap();
        assert!(DaemonConfig::load(&path).is_err());
        std::fs::write(&path, "not json").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
