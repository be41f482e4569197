//! Pid bookkeeping: pidfiles, liveness, /proc verification.

use std::fs;
use std::path::Path;

use arbor_shared::{ArborError, ArborResult};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Read `/proc/<pid>/comm` without the trailing newline.
pub fn read_comm(pid: u32) -> ArborResult<String> {
    let comm = fs::read_to_string(format!("/proc/{}/comm", pid))
        .map_err(|e| ArborError::from(e).context(format!("cannot read comm of pid {}", pid)))?;
    Ok(comm.trim_end().to_string())
}

/// Null-signal liveness probe.
pub fn is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Send a signal to one process.
pub fn kill_one(pid: u32, sig: Signal) -> ArborResult<()> {
    signal::kill(Pid::from_raw(pid as i32), sig).map_err(|e| {
        ArborError::with_errno(
            arbor_shared::ErrorKind::Unknown,
            e as i32,
            format!("kill({}, {}) failed: {}", pid, sig, e),
        )
    })
}

/// A pidfile holding `"<pid>\n<comm>"`.
///
/// Reads verify the recorded comm against the live `/proc/<pid>/comm` so
/// a recycled pid is never mistaken for the daemon.
#[derive(Debug, Clone)]
pub struct PidFile {
    pub path: std::path::PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, pid: u32, comm: &str) -> ArborResult<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{}\n{}", pid, comm))
            .map_err(|e| ArborError::from(e).context("writing pidfile"))?;
        fs::rename(&tmp, &self.path).map_err(|e| ArborError::from(e).context("renaming pidfile"))?;
        Ok(())
    }

    /// Load and verify; `Ok(None)` when the file is absent or stale.
    pub fn load(&self) -> ArborResult<Option<u32>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ArborError::from(e).context("reading pidfile")),
        };
        let mut lines = content.lines();
        let pid: u32 = match lines.next().and_then(|l| l.trim().parse().ok()) {
            Some(pid) => pid,
            None => return Ok(None),
        };
        let expected_comm = lines.next().unwrap_or("").trim();
        match read_comm(pid) {
            Ok(comm) if comm == expected_comm => Ok(Some(pid)),
            _ => Ok(None),
        }
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_alive_current() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(999_999_999));
    }

    #[test]
    fn test_pidfile_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pidfile = PidFile::new(dir.path().join("arbord.pid"));
        let my_pid = std::process::id();
        let my_comm = read_comm(my_pid).unwrap();

        pidfile.save(my_pid, &my_comm).unwrap();
        assert_eq!(pidfile.load().unwrap(), Some(my_pid));
    }

    #[test]
    fn test_pidfile_rejects_stale_comm() {
        let dir = TempDir::new().unwrap();
        let pidfile = PidFile::new(dir.path().join("arbord.pid"));
        pidfile.save(std::process::id(), "definitely-not-us").unwrap();
        assert_eq!(pidfile.load().unwrap(), None);
    }

    #[test]
    fn test_pidfile_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let pidfile = PidFile::new(dir.path().join("none.pid"));
        assert_eq!(pidfile.load().unwrap(), None);
        pidfile.remove();
    }
}
