//! Namespace fd handling.

use std::os::fd::{AsFd, OwnedFd};

use arbor_shared::{ArborError, ArborResult, ErrorKind};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;

/// Namespace kinds the daemon enters or creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    Mnt,
    Pid,
    Net,
    Ipc,
    Uts,
    User,
    Cgroup,
}

impl NsKind {
    pub fn proc_name(self) -> &'static str {
        match self {
            NsKind::Mnt => "mnt",
            NsKind::Pid => "pid",
            NsKind::Net => "net",
            NsKind::Ipc => "ipc",
            NsKind::Uts => "uts",
            NsKind::User => "user",
            NsKind::Cgroup => "cgroup",
        }
    }

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::User => CloneFlags::CLONE_NEWUSER,
            NsKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }
}

/// Open `/proc/<pid>/ns/<kind>` for a later [`enter`].
pub fn open_ns(pid: u32, kind: NsKind) -> ArborResult<OwnedFd> {
    let path = format!("/proc/{}/ns/{}", pid, kind.proc_name());
    open(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()).map_err(|e| {
        ArborError::with_errno(
            ErrorKind::Unknown,
            e as i32,
            format!("opening {}: {}", path, e),
        )
    })
}

/// Join a previously opened namespace.
pub fn enter(ns_fd: &OwnedFd, kind: NsKind) -> ArborResult<()> {
    setns(ns_fd.as_fd(), kind.clone_flag()).map_err(|e| {
        ArborError::with_errno(
            ErrorKind::Unknown,
            e as i32,
            format!("setns({}): {}", kind.proc_name(), e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_own_namespaces() {
        for kind in [NsKind::Mnt, NsKind::Net, NsKind::Uts, NsKind::Ipc] {
            // Our own namespaces are always openable.
            open_ns(std::process::id(), kind)
                .unwrap_or_else(|e| panic!("{}: {}", kind.proc_name(), e));
        }
    }

    #[test]
    fn test_missing_pid_fails() {
        assert!(open_ns(999_999_999, NsKind::Mnt).is_err());
    }
}
