//! Cgroup driver: controller mask, per-container cgroups, freezer,
//! memory OOM events.
//!
//! One v1-style hierarchy per controller under the cgroup filesystem
//! root. Container cgroups are flat directories named by the daemon
//! prefix plus the percent-escaped container name, so a pid's freezer
//! cgroup path maps straight back to its container.

pub mod ns;

use std::fmt;
use std::fs;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use arbor_shared::{ArborError, ArborResult, ErrorKind};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::signal::Signal;

use crate::util::path::{escape_name, unescape_name};
use crate::util::proc::kill_one;

/// Directory-name prefix of every cgroup the daemon owns.
pub const CGROUP_PREFIX: &str = "arbor";

/// Bitmask of cgroup controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Controllers(u64);

impl Controllers {
    pub const FREEZER: Controllers = Controllers(1 << 0);
    pub const MEMORY: Controllers = Controllers(1 << 1);
    pub const CPU: Controllers = Controllers(1 << 2);
    pub const CPUACCT: Controllers = Controllers(1 << 3);
    pub const BLKIO: Controllers = Controllers(1 << 4);
    pub const DEVICES: Controllers = Controllers(1 << 5);
    pub const NETCLS: Controllers = Controllers(1 << 6);
    pub const PIDS: Controllers = Controllers(1 << 7);
    pub const HUGETLB: Controllers = Controllers(1 << 8);
    pub const CPUSET: Controllers = Controllers(1 << 9);
    pub const PERF_EVENT: Controllers = Controllers(1 << 10);

    const ALL_NAMES: &'static [(&'static str, Controllers)] = &[
        ("freezer", Controllers::FREEZER),
        ("memory", Controllers::MEMORY),
        ("cpu", Controllers::CPU),
        ("cpuacct", Controllers::CPUACCT),
        ("blkio", Controllers::BLKIO),
        ("devices", Controllers::DEVICES),
        ("net_cls", Controllers::NETCLS),
        ("pids", Controllers::PIDS),
        ("hugetlb", Controllers::HUGETLB),
        ("cpuset", Controllers::CPUSET),
        ("perf_event", Controllers::PERF_EVENT),
    ];

    /// Controllers every container carries.
    pub fn required() -> Controllers {
        Controllers::FREEZER
            | Controllers::MEMORY
            | Controllers::CPU
            | Controllers::CPUACCT
            | Controllers::BLKIO
            | Controllers::DEVICES
            | Controllers::NETCLS
    }

    /// Default set of the distinguished porto-root child.
    pub fn porto_root_default() -> Controllers {
        Controllers::FREEZER | Controllers::MEMORY | Controllers::CPUACCT
    }

    pub fn empty() -> Controllers {
        Controllers(0)
    }

    pub fn all() -> Controllers {
        Self::ALL_NAMES
            .iter()
            .fold(Controllers(0), |acc, (_, c)| acc | *c)
    }

    pub fn contains(self, other: Controllers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::ALL_NAMES
            .iter()
            .filter(|(_, c)| self.contains(*c))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl std::ops::BitOr for Controllers {
    type Output = Controllers;
    fn bitor(self, rhs: Controllers) -> Controllers {
        Controllers(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Controllers {
    fn bitor_assign(&mut self, rhs: Controllers) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for Controllers {
    type Output = Controllers;
    fn bitand(self, rhs: Controllers) -> Controllers {
        Controllers(self.0 & rhs.0)
    }
}

impl fmt::Display for Controllers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(";"))
    }
}

impl FromStr for Controllers {
    type Err = ArborError;

    fn from_str(s: &str) -> ArborResult<Self> {
        let mut mask = Controllers::empty();
        for name in s.split(';').filter(|n| !n.is_empty()) {
            let found = Self::ALL_NAMES
                .iter()
                .find(|(candidate, _)| *candidate == name.trim());
            match found {
                Some((_, c)) => mask |= *c,
                None => {
                    return Err(ArborError::invalid_value(format!(
                        "unknown cgroup controller {:?}",
                        name
                    )))
                }
            }
        }
        Ok(mask)
    }
}

/// One container cgroup inside one controller hierarchy.
#[derive(Debug, Clone)]
pub struct Cgroup {
    pub controller: &'static str,
    pub path: PathBuf,
}

impl Cgroup {
    fn knob_path(&self, knob: &str) -> PathBuf {
        self.path.join(knob)
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn get_knob(&self, knob: &str) -> ArborResult<String> {
        let path = self.knob_path(knob);
        let value = fs::read_to_string(&path)
            .map_err(|e| ArborError::from(e).context(format!("reading {}", path.display())))?;
        Ok(value.trim_end().to_string())
    }

    pub fn get_knob_u64(&self, knob: &str) -> ArborResult<u64> {
        let raw = self.get_knob(knob)?;
        raw.parse::<u64>().map_err(|_| {
            ArborError::invalid_data(format!("cgroup knob {} holds {:?}", knob, raw))
        })
    }

    pub fn set_knob(&self, knob: &str, value: &str) -> ArborResult<()> {
        let path = self.knob_path(knob);
        fs::write(&path, value)
            .map_err(|e| ArborError::from(e).context(format!("writing {}", path.display())))
    }

    /// All pids currently attached.
    pub fn procs(&self) -> ArborResult<Vec<u32>> {
        let raw = self.get_knob("cgroup.procs")?;
        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    pub fn attach(&self, pid: u32) -> ArborResult<()> {
        self.set_knob("cgroup.procs", &pid.to_string())
            .map_err(|e| e.context(format!("attaching pid {}", pid)))
    }

    /// Signal every attached pid until the cgroup drains or the deadline
    /// passes.
    pub fn kill_all(&self, sig: Signal, deadline: Instant) -> ArborResult<()> {
        loop {
            let procs = match self.procs() {
                Ok(procs) => procs,
                // Concurrent rmdir is fine, the cgroup is gone.
                Err(_) if !self.exists() => return Ok(()),
                Err(e) => return Err(e),
            };
            if procs.is_empty() {
                return Ok(());
            }
            for pid in &procs {
                let _ = kill_one(*pid, sig);
            }
            if Instant::now() >= deadline {
                return Err(ArborError::busy(format!(
                    "cgroup {} still holds {} tasks",
                    self.path.display(),
                    procs.len()
                )));
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

/// Per-hierarchy cgroup driver.
#[derive(Debug, Clone)]
pub struct CgroupDriver {
    root: PathBuf,
}

impl CgroupDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cgroup directory name of a container.
    pub fn cgroup_name(container: &str) -> String {
        if container == "/" {
            CGROUP_PREFIX.to_string()
        } else {
            format!("{}%{}", CGROUP_PREFIX, escape_name(container))
        }
    }

    /// Inverse of [`CgroupDriver::cgroup_name`]; `None` for foreign paths.
    pub fn container_of_cgroup(cgroup_path: &str) -> Option<String> {
        let name = cgroup_path.trim_start_matches('/');
        if name == CGROUP_PREFIX {
            return Some("/".to_string());
        }
        let escaped = name.strip_prefix(CGROUP_PREFIX)?.strip_prefix('%')?;
        Some(unescape_name(escaped))
    }

    pub fn cgroup(&self, controller: &'static str, container: &str) -> Cgroup {
        Cgroup {
            controller,
            path: self
                .root
                .join(controller)
                .join(Self::cgroup_name(container)),
        }
    }

    pub fn create(&self, controller: &'static str, container: &str) -> ArborResult<Cgroup> {
        let cg = self.cgroup(controller, container);
        fs::create_dir_all(&cg.path)
            .map_err(|e| ArborError::from(e).context(format!("creating {}", cg.path.display())))?;
        Ok(cg)
    }

    /// Remove a cgroup directory, retrying transient EBUSY while exiting
    /// tasks unhook.
    pub fn remove(&self, cg: &Cgroup, deadline: Instant) -> ArborResult<()> {
        loop {
            match fs::remove_dir(&cg.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(ArborError::from(e)
                        .context(format!("removing cgroup {}", cg.path.display())))
                }
            }
        }
    }

    /// Freezer cgroup path of a pid, from `/proc/<pid>/cgroup`.
    pub fn freezer_path_of_pid(pid: u32) -> ArborResult<String> {
        let content = fs::read_to_string(format!("/proc/{}/cgroup", pid))
            .map_err(|e| ArborError::from(e).context(format!("reading cgroup of pid {}", pid)))?;
        for line in content.lines() {
            // hierarchy-id:controllers:path
            let mut fields = line.splitn(3, ':');
            let _id = fields.next();
            let controllers = fields.next().unwrap_or("");
            let path = fields.next().unwrap_or("");
            if controllers.split(',').any(|c| c == "freezer") {
                return Ok(path.to_string());
            }
        }
        Err(ArborError::invalid_data(format!(
            "pid {} has no freezer cgroup",
            pid
        )))
    }
}

/// Freezer states as the kernel reports them.
pub const FREEZER_FROZEN: &str = "FROZEN";
pub const FREEZER_THAWED: &str = "THAWED";

pub fn freeze(freezer: &Cgroup, deadline: Instant) -> ArborResult<()> {
    freezer.set_knob("freezer.state", FREEZER_FROZEN)?;
    wait_freezer_state(freezer, FREEZER_FROZEN, deadline)
}

pub fn thaw(freezer: &Cgroup, deadline: Instant) -> ArborResult<()> {
    freezer.set_knob("freezer.state", FREEZER_THAWED)?;
    wait_freezer_state(freezer, FREEZER_THAWED, deadline)
}

pub fn is_frozen(freezer: &Cgroup) -> bool {
    freezer
        .get_knob("freezer.state")
        .map(|s| s != FREEZER_THAWED)
        .unwrap_or(false)
}

fn wait_freezer_state(freezer: &Cgroup, want: &str, deadline: Instant) -> ArborResult<()> {
    loop {
        if freezer.get_knob("freezer.state")? == want {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ArborError::busy(format!(
                "freezer {} did not reach {}",
                freezer.path.display(),
                want
            )));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Register a nonblocking eventfd on a memory cgroup's OOM control.
///
/// The returned eventfd is armed by the kernel on every OOM in the
/// cgroup; the epoll loop owns it and reads one 64-bit counter per wake.
pub fn register_oom_event(memory: &Cgroup) -> ArborResult<EventFd> {
    let efd = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC).map_err(|e| {
        ArborError::with_errno(ErrorKind::Unknown, e as i32, format!("eventfd: {}", e))
    })?;
    let oom_control = fs::File::open(memory.knob_path("memory.oom_control"))
        .map_err(|e| ArborError::from(e).context("opening memory.oom_control"))?;
    let mut event_control = fs::OpenOptions::new()
        .write(true)
        .open(memory.knob_path("cgroup.event_control"))
        .map_err(|e| ArborError::from(e).context("opening cgroup.event_control"))?;
    event_control
        .write_all(format!("{} {}", efd.as_raw_fd(), oom_control.as_raw_fd()).as_bytes())
        .map_err(|e| ArborError::from(e).context("arming oom eventfd"))?;
    Ok(efd)
}

/// OOM kill count recorded by the memory controller.
pub fn oom_kill_count(memory: &Cgroup) -> u64 {
    let raw = match memory.get_knob("memory.oom_control") {
        Ok(raw) => raw,
        Err(_) => return 0,
    };
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("oom_kill ") {
            return rest.trim().parse().unwrap_or(0);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controllers_parse_display_roundtrip() {
        let mask: Controllers = "freezer;memory;cpu".parse().unwrap();
        assert!(mask.contains(Controllers::FREEZER));
        assert!(mask.contains(Controllers::MEMORY | Controllers::CPU));
        assert!(!mask.contains(Controllers::PIDS));
        let back: Controllers = mask.to_string().parse().unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn test_controllers_reject_unknown() {
        assert!("freezer;bogus".parse::<Controllers>().is_err());
    }

    #[test]
    fn test_required_is_superset_of_porto_root() {
        let required = Controllers::required();
        assert!(required.contains(Controllers::porto_root_default()));
        assert!(Controllers::all().contains(required));
    }

    #[test]
    fn test_cgroup_name_roundtrip() {
        for name in ["/", "a", "a/b", "a/b/c", "x%y"] {
            let cgname = CgroupDriver::cgroup_name(name);
            assert_eq!(
                CgroupDriver::container_of_cgroup(&format!("/{}", cgname)).as_deref(),
                Some(name)
            );
        }
    }

    #[test]
    fn test_foreign_cgroup_path_is_none() {
        assert_eq!(CgroupDriver::container_of_cgroup("/user.slice"), None);
        assert_eq!(CgroupDriver::container_of_cgroup("/"), None);
    }

    #[test]
    fn test_cgroup_paths() {
        let driver = CgroupDriver::new("/sys/fs/cgroup");
        let cg = driver.cgroup("freezer", "a/b");
        assert_eq!(
            cg.path,
            PathBuf::from("/sys/fs/cgroup/freezer/arbor%a%b")
        );
    }
}
