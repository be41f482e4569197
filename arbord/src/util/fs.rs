//! Filesystem plumbing: bind remounts, statfs, fd-anchored walks.
//!
//! Mount operations follow the two-stage scheme the volume engine relies
//! on: a new bind is first made `MS_PRIVATE` in a scratch location to
//! detach it from the shared propagation group, then re-bound with its
//! final flags and atomically moved onto the target through the proc path
//! of an already-opened directory fd.

use std::collections::HashSet;
use std::fs;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Component, Path, PathBuf};

use arbor_shared::{ArborError, ArborResult, ErrorKind};
use nix::fcntl::{open, openat, AtFlags, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{mkdirat, Mode};
use nix::unistd::{fchownat, Gid, Uid};

fn sys_err(ctx: &str, err: nix::errno::Errno) -> ArborError {
    ArborError::with_errno(ErrorKind::Unknown, err as i32, format!("{}: {}", ctx, err))
}

/// Snapshot of filesystem usage at a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStat {
    pub space_total: u64,
    pub space_avail: u64,
    pub space_used: u64,
    pub inode_total: u64,
    pub inode_avail: u64,
    pub inode_used: u64,
}

pub fn statvfs_info(path: &Path) -> ArborResult<FsStat> {
    let st = nix::sys::statvfs::statvfs(path)
        .map_err(|e| sys_err(&format!("statvfs {}", path.display()), e))?;
    let frag = st.fragment_size() as u64;
    let total = st.blocks() as u64 * frag;
    let avail = st.blocks_available() as u64 * frag;
    let free = st.blocks_free() as u64 * frag;
    Ok(FsStat {
        space_total: total,
        space_avail: avail,
        space_used: total.saturating_sub(free),
        inode_total: st.files() as u64,
        inode_avail: st.files_available() as u64,
        inode_used: (st.files() as u64).saturating_sub(st.files_free() as u64),
    })
}

/// Change mount propagation of one mount point.
pub fn set_propagation(target: &Path, flags: MsFlags) -> ArborResult<()> {
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
        .map_err(|e| sys_err(&format!("set propagation on {}", target.display()), e))
}

/// Plain bind mount, optionally recursive.
pub fn bind_mount(source: &Path, target: &Path, recursive: bool) -> ArborResult<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|e| {
        sys_err(
            &format!("bind {} onto {}", source.display(), target.display()),
            e,
        )
    })
}

/// Remount an existing bind with new flags (read-only, nosuid, ...).
pub fn remount_bind(target: &Path, extra: MsFlags) -> ArborResult<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | extra,
        None::<&str>,
    )
    .map_err(|e| sys_err(&format!("remount {}", target.display()), e))
}

pub fn mount_tmpfs(target: &Path, data: &str) -> ArborResult<()> {
    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(data),
    )
    .map_err(|e| sys_err(&format!("mount tmpfs at {}", target.display()), e))
}

/// Mount an overlay; lowerdirs are colon-joined bottom→top.
pub fn mount_overlay(
    target: &Path,
    lower: &[PathBuf],
    upper: &Path,
    work: &Path,
) -> ArborResult<()> {
    let lowerdir = lower
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":");
    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        lowerdir,
        upper.display(),
        work.display()
    );
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|e| sys_err(&format!("mount overlay at {}", target.display()), e))
}

/// Lazy unmount.
pub fn umount_detach(target: &Path) -> ArborResult<()> {
    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| sys_err(&format!("umount {}", target.display()), e))
}

/// Proc path addressing an open fd, usable as a mount target.
pub fn proc_fd_path<F: AsRawFd>(fd: &F) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

/// Atomically move a prepared mount onto the directory behind `target_fd`.
///
/// Moving onto the proc path of an opened fd races atomically against
/// other namespace observers of the real path.
pub fn move_mount_onto_fd(source: &Path, target_fd: &OwnedFd) -> ArborResult<()> {
    let target = proc_fd_path(target_fd);
    mount(
        Some(source),
        &target,
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| {
        sys_err(
            &format!("move mount {} onto fd {}", source.display(), target.display()),
            e,
        )
    })
}

/// Open a directory as an anchor for `O_NOFOLLOW` component walks.
pub fn open_dir(path: &Path) -> ArborResult<OwnedFd> {
    open(
        path,
        OFlag::O_DIRECTORY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
        Mode::empty(),
    )
    .map_err(|e| sys_err(&format!("open dir {}", path.display()), e))
}

/// Walk `rel` downward from `base`, opening every component with
/// `O_NOFOLLOW` so no symlink can redirect the walk outside the base.
///
/// Missing components are created with `mode` and chowned to `owner`
/// when `create` is set; otherwise a missing component is an error.
/// Returns the fd of the final directory.
pub fn walk_at(
    base: &OwnedFd,
    rel: &Path,
    create: Option<(Uid, Gid, Mode)>,
) -> ArborResult<OwnedFd> {
    if rel.is_absolute() {
        return Err(ArborError::invalid_path(format!(
            "walk path {} must be relative",
            rel.display()
        )));
    }
    let mut current = base
        .try_clone()
        .map_err(|e| ArborError::from(e).context("dup walk base fd"))?;
    for component in rel.components() {
        let name = match component {
            Component::Normal(name) => name,
            Component::CurDir => continue,
            _ => {
                return Err(ArborError::invalid_path(format!(
                    "walk path {} escapes its base",
                    rel.display()
                )))
            }
        };
        let next = match openat(
            current.as_fd(),
            name,
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::ENOENT) => {
                let (uid, gid, mode) = match create {
                    Some(c) => c,
                    None => {
                        return Err(ArborError::invalid_path(format!(
                            "{} does not exist",
                            Path::new(name).display()
                        )))
                    }
                };
                mkdirat(current.as_fd(), name, mode)
                    .map_err(|e| sys_err("mkdirat during target walk", e))?;
                fchownat(
                    current.as_fd(),
                    name,
                    Some(uid),
                    Some(gid),
                    AtFlags::AT_SYMLINK_NOFOLLOW,
                )
                .map_err(|e| sys_err("chown during target walk", e))?;
                openat(
                    current.as_fd(),
                    name,
                    OFlag::O_DIRECTORY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW,
                    Mode::empty(),
                )
                .map_err(|e| sys_err("reopen created walk component", e))?
            }
            Err(nix::errno::Errno::ELOOP) | Err(nix::errno::Errno::ENOTDIR) => {
                return Err(ArborError::invalid_path(format!(
                    "component {:?} is a symlink or not a directory",
                    name
                )))
            }
            Err(e) => return Err(sys_err("openat during target walk", e)),
        };
        current = next;
    }
    Ok(current)
}

/// Mount points of the current mount namespace, from mountinfo.
pub fn mount_points() -> ArborResult<HashSet<PathBuf>> {
    let content = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| ArborError::from(e).context("reading mountinfo"))?;
    Ok(parse_mountinfo(&content))
}

/// Extract field 5 (mount point) from each mountinfo line, undoing the
/// kernel's octal escapes.
pub fn parse_mountinfo(content: &str) -> HashSet<PathBuf> {
    let mut points = HashSet::new();
    for line in content.lines() {
        if let Some(raw) = line.split_whitespace().nth(4) {
            points.insert(PathBuf::from(unescape_octal(raw)));
        }
    }
    points
}

fn unescape_octal(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &raw[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_statvfs_info() {
        let dir = TempDir::new().unwrap();
        let st = statvfs_info(dir.path()).unwrap();
        assert!(st.space_total >= st.space_avail);
    }

    #[test]
    fn test_parse_mountinfo_octal_escapes() {
        let content = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
90 22 0:43 / /mnt/a\\040b rw shared:45 - tmpfs tmpfs rw
91 22 0:44 / /mnt/plain rw shared:46 - tmpfs tmpfs rw
";
        let points = parse_mountinfo(content);
        assert!(points.contains(Path::new("/")));
        assert!(points.contains(Path::new("/mnt/a b")));
        assert!(points.contains(Path::new("/mnt/plain")));
    }

    #[test]
    fn test_walk_at_existing_and_created() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let base = open_dir(dir.path()).unwrap();

        walk_at(&base, Path::new("a/b"), None).unwrap();
        assert!(walk_at(&base, Path::new("a/missing"), None).is_err());

        let uid = Uid::current();
        let gid = Gid::current();
        walk_at(
            &base,
            Path::new("a/new/deep"),
            Some((uid, gid, Mode::from_bits_truncate(0o755))),
        )
        .unwrap();
        assert!(dir.path().join("a/new/deep").is_dir());
    }

    #[test]
    fn test_walk_at_rejects_escape_and_symlink() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
        let base = open_dir(dir.path()).unwrap();

        assert!(walk_at(&base, Path::new("../escape"), None).is_err());
        assert!(walk_at(&base, Path::new("/abs"), None).is_err());
        // Symlinked component must be refused even though it resolves inside.
        assert!(walk_at(&base, Path::new("link"), None).is_err());
    }
}
