//! `quota` backend and the shared project-quota plumbing.
//!
//! A quota volume confines an existing directory with an ext4/xfs
//! project quota and performs no mount. `native` and `overlay` reuse
//! [`proj`] to confine their storage directories.

use arbor_shared::{ArborError, ArborResult};

use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::util::fs::FsStat;

pub struct QuotaBackend;

impl VolumeBackend for QuotaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Quota
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(vol.storage.is_none(), "quota volumes have no storage")?;
        require(vol.layers.is_empty(), "quota volumes have no layers")?;
        require(!vol.read_only, "quota volumes cannot be read-only")?;
        require(
            vol.space_limit > 0 || vol.inode_limit > 0,
            "quota volumes require a space or inode limit",
        )?;
        require(!vol.auto_path, "quota volumes require an existing path")?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let quota = proj::ProjectQuota::for_dir(&vol.path)?;
        quota.enable(vol.space_limit, vol.inode_limit)
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        if let Ok(quota) = proj::ProjectQuota::for_dir(&vol.path) {
            let _ = quota.disable();
        }
        Ok(())
    }

    fn resize(&self, vol: &mut BackendVolume, space: u64, inodes: u64) -> ArborResult<()> {
        let quota = proj::ProjectQuota::for_dir(&vol.path)?;
        quota.set_limits(space, inodes)?;
        vol.space_limit = space;
        vol.inode_limit = inodes;
        Ok(())
    }

    fn statfs(&self, vol: &BackendVolume) -> ArborResult<FsStat> {
        let mut st = crate::util::fs::statvfs_info(&vol.path)?;
        if let Ok(quota) = proj::ProjectQuota::for_dir(&vol.path) {
            if let Ok(usage) = quota.usage() {
                st.space_used = usage.space_used;
                st.inode_used = usage.inode_used;
                if vol.space_limit > 0 {
                    st.space_total = vol.space_limit;
                    st.space_avail = vol.space_limit.saturating_sub(usage.space_used);
                }
                if vol.inode_limit > 0 {
                    st.inode_total = vol.inode_limit;
                    st.inode_avail = vol.inode_limit.saturating_sub(usage.inode_used);
                }
            }
        }
        Ok(st)
    }
}

/// ext4/xfs project quota over directory trees.
pub mod proj {
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};

    use arbor_shared::{ArborError, ArborResult, ErrorKind};

    /// Project ids carved out for volumes: inode number with the high
    /// bit set, the same scheme the kernel tools use for per-tree ids.
    const PROJECT_ID_FLAG: u32 = 0x8000_0000;

    const PRJQUOTA: libc::c_int = 2;
    const SUBCMDSHIFT: libc::c_int = 8;
    const Q_GETQUOTA: libc::c_int = 0x800007;
    const Q_SETQUOTA: libc::c_int = 0x800008;
    const QIF_BLIMITS: u32 = 1;
    const QIF_ILIMITS: u32 = 4;
    /// dqblk block units.
    const QUOTA_BLOCK: u64 = 1024;

    const FS_IOC_FSGETXATTR: libc::c_ulong = 0x801c_5831;
    const FS_IOC_FSSETXATTR: libc::c_ulong = 0x401c_5832;
    const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    struct FsXAttr {
        fsx_xflags: u32,
        fsx_extsize: u32,
        fsx_nextents: u32,
        fsx_projid: u32,
        fsx_cowextsize: u32,
        fsx_pad: [u8; 8],
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct QuotaUsage {
        pub space_used: u64,
        pub inode_used: u64,
    }

    /// Handle on one directory's project quota.
    #[derive(Debug)]
    pub struct ProjectQuota {
        dir: PathBuf,
        device: PathBuf,
        project_id: u32,
    }

    impl ProjectQuota {
        /// Derive the project id and backing device for a directory.
        pub fn for_dir(dir: &Path) -> ArborResult<Self> {
            let meta = std::fs::metadata(dir)
                .map_err(|e| ArborError::from(e).context(format!("stat {}", dir.display())))?;
            let project_id = (meta.ino() as u32) | PROJECT_ID_FLAG;
            let device = device_of(dir)?;
            Ok(Self {
                dir: dir.to_path_buf(),
                device,
                project_id,
            })
        }

        pub fn project_id(&self) -> u32 {
            self.project_id
        }

        /// Tag the tree root and apply limits.
        pub fn enable(&self, space_limit: u64, inode_limit: u64) -> ArborResult<()> {
            self.set_project_id(self.project_id)?;
            self.set_limits(space_limit, inode_limit)
        }

        /// Clear limits and untag the root.
        pub fn disable(&self) -> ArborResult<()> {
            let _ = self.set_limits(0, 0);
            self.set_project_id(0)
        }

        fn set_project_id(&self, project_id: u32) -> ArborResult<()> {
            let file = File::open(&self.dir)
                .map_err(|e| ArborError::from(e).context("opening quota dir"))?;
            let mut attr = FsXAttr::default();
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FSGETXATTR, &mut attr) };
            if rc != 0 {
                return Err(quota_errno("FS_IOC_FSGETXATTR"));
            }
            attr.fsx_projid = project_id;
            if project_id != 0 {
                attr.fsx_xflags |= FS_XFLAG_PROJINHERIT;
            } else {
                attr.fsx_xflags &= !FS_XFLAG_PROJINHERIT;
            }
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FSSETXATTR, &attr) };
            if rc != 0 {
                return Err(quota_errno("FS_IOC_FSSETXATTR"));
            }
            Ok(())
        }

        pub fn set_limits(&self, space_limit: u64, inode_limit: u64) -> ArborResult<()> {
            let mut dqblk: libc::dqblk = unsafe { std::mem::zeroed() };
            dqblk.dqb_bhardlimit = space_limit.div_ceil(QUOTA_BLOCK);
            dqblk.dqb_bsoftlimit = dqblk.dqb_bhardlimit;
            dqblk.dqb_ihardlimit = inode_limit;
            dqblk.dqb_isoftlimit = inode_limit;
            dqblk.dqb_valid = QIF_BLIMITS | QIF_ILIMITS;
            self.quotactl(Q_SETQUOTA, &mut dqblk)
        }

        pub fn usage(&self) -> ArborResult<QuotaUsage> {
            let mut dqblk: libc::dqblk = unsafe { std::mem::zeroed() };
            self.quotactl(Q_GETQUOTA, &mut dqblk)?;
            Ok(QuotaUsage {
                space_used: dqblk.dqb_curspace,
                inode_used: dqblk.dqb_curinodes,
            })
        }

        fn quotactl(&self, cmd: libc::c_int, dqblk: &mut libc::dqblk) -> ArborResult<()> {
            let device = std::ffi::CString::new(self.device.to_string_lossy().into_owned())
                .map_err(|_| ArborError::invalid_path("device path contains NUL"))?;
            let rc = unsafe {
                libc::quotactl(
                    (cmd << SUBCMDSHIFT) | PRJQUOTA,
                    device.as_ptr(),
                    self.project_id as libc::c_int,
                    dqblk as *mut libc::dqblk as *mut libc::c_char,
                )
            };
            if rc != 0 {
                return Err(quota_errno("quotactl"));
            }
            Ok(())
        }
    }

    fn quota_errno(what: &str) -> ArborError {
        let err = std::io::Error::last_os_error();
        let kind = match err.raw_os_error() {
            Some(libc::ENOTSUP) | Some(libc::EOPNOTSUPP) | Some(libc::ESRCH) => {
                ErrorKind::NotSupported
            }
            _ => ErrorKind::Unknown,
        };
        ArborError::with_errno(
            kind,
            err.raw_os_error().unwrap_or(0),
            format!("{}: {}", what, err),
        )
    }

    /// Backing block device of the filesystem holding `path`.
    pub fn device_of(path: &Path) -> ArborResult<PathBuf> {
        let content = std::fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| ArborError::from(e).context("reading mountinfo"))?;
        best_mount_source(&content, path).ok_or_else(|| {
            ArborError::not_supported(format!(
                "no block device found for {}",
                path.display()
            ))
        })
    }

    /// Longest-prefix mountinfo match; returns the mount source field.
    pub fn best_mount_source(mountinfo: &str, path: &Path) -> Option<PathBuf> {
        let mut best: Option<(usize, PathBuf)> = None;
        for line in mountinfo.lines() {
            let mut halves = line.splitn(2, " - ");
            let head = halves.next()?;
            let tail = halves.next().unwrap_or("");
            let mount_point = head.split_whitespace().nth(4)?;
            let source = tail.split_whitespace().nth(1)?;
            if !source.starts_with('/') {
                continue;
            }
            let mount_point = Path::new(mount_point);
            if path.starts_with(mount_point) {
                let depth = mount_point.components().count();
                if best.as_ref().map(|(d, _)| depth >= *d).unwrap_or(true) {
                    best = Some((depth, PathBuf::from(source)));
                }
            }
        }
        best.map(|(_, source)| source)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
90 22 8:2 / /place rw,relatime shared:45 - ext4 /dev/sdb1 rw,prjquota
95 22 0:44 / /tmp rw shared:46 - tmpfs tmpfs rw
";

        #[test]
        fn test_best_mount_source_longest_prefix() {
            assert_eq!(
                best_mount_source(MOUNTINFO, Path::new("/place/porto_volumes/1")),
                Some(PathBuf::from("/dev/sdb1"))
            );
            assert_eq!(
                best_mount_source(MOUNTINFO, Path::new("/home/u")),
                Some(PathBuf::from("/dev/sda1"))
            );
            // tmpfs has no block-device source.
            assert_eq!(
                best_mount_source(MOUNTINFO, Path::new("/tmp/x")),
                Some(PathBuf::from("/dev/sda1"))
            );
        }
    }
}
