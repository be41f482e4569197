//! Storage backends.
//!
//! One implementation per backend kind behind [`VolumeBackend`], all
//! sharing the build/destroy/resize/statfs/check contract. The volume
//! engine owns paths, links and accounting; backends only materialize
//! and tear down the bytes.

mod bind;
mod dir;
mod loopdev;
mod lvm;
mod native;
mod overlay;
mod plain;
mod quota;
mod rbd;
mod squash;
mod tmpfs;

use std::path::PathBuf;
use std::str::FromStr;

use arbor_shared::{ArborError, ArborResult};

use crate::util::fs::FsStat;

pub use loopdev::{LOOP_MIN_ONLINE_GROW_BYTES, MIN_LOOP_IMAGE_BYTES};
pub use overlay::TOO_MANY_LAYERS;

/// Backend kinds, as written in the `backend` volume property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Dir,
    Plain,
    Bind,
    Rbind,
    Tmpfs,
    HugeTmpfs,
    Quota,
    Native,
    Overlay,
    Loop,
    Squash,
    Lvm,
    Rbd,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Dir => "dir",
            BackendKind::Plain => "plain",
            BackendKind::Bind => "bind",
            BackendKind::Rbind => "rbind",
            BackendKind::Tmpfs => "tmpfs",
            BackendKind::HugeTmpfs => "hugetmpfs",
            BackendKind::Quota => "quota",
            BackendKind::Native => "native",
            BackendKind::Overlay => "overlay",
            BackendKind::Loop => "loop",
            BackendKind::Squash => "squash",
            BackendKind::Lvm => "lvm",
            BackendKind::Rbd => "rbd",
        }
    }

    /// Backend picked when the volume spec names none: overlay when
    /// layers are declared, otherwise native.
    pub fn default_for(has_layers: bool) -> BackendKind {
        if has_layers {
            BackendKind::Overlay
        } else {
            BackendKind::Native
        }
    }
}

impl FromStr for BackendKind {
    type Err = ArborError;

    fn from_str(s: &str) -> ArborResult<Self> {
        match s {
            "dir" => Ok(BackendKind::Dir),
            "plain" => Ok(BackendKind::Plain),
            "bind" => Ok(BackendKind::Bind),
            "rbind" => Ok(BackendKind::Rbind),
            "tmpfs" => Ok(BackendKind::Tmpfs),
            "hugetmpfs" => Ok(BackendKind::HugeTmpfs),
            "quota" => Ok(BackendKind::Quota),
            "native" => Ok(BackendKind::Native),
            "overlay" => Ok(BackendKind::Overlay),
            "loop" => Ok(BackendKind::Loop),
            "squash" => Ok(BackendKind::Squash),
            "lvm" => Ok(BackendKind::Lvm),
            "rbd" => Ok(BackendKind::Rbd),
            other => Err(ArborError::invalid_value(format!(
                "unknown volume backend {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend-facing view of one volume.
#[derive(Debug, Clone)]
pub struct BackendVolume {
    pub id: String,
    /// Host-side mountpoint of the volume.
    pub path: PathBuf,
    /// Canonical mount location under the place's internal tree.
    pub internal: PathBuf,
    /// Storage path, remote descriptor, or None for volume-owned storage.
    pub storage: Option<String>,
    pub place: PathBuf,
    /// Per-volume scratch directory under the place.
    pub temp_dir: PathBuf,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub space_guarantee: u64,
    pub read_only: bool,
    /// Resolved lower directories, bottom to top.
    pub layers: Vec<PathBuf>,
    pub cred_uid: u32,
    pub cred_gid: u32,
    pub permissions: u32,
    /// Loop device index when attached, -1 otherwise.
    pub loop_index: i32,
    /// Whether the path was chosen by the engine rather than the caller.
    pub auto_path: bool,
}

impl BackendVolume {
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage
            .as_ref()
            .filter(|s| s.starts_with('/'))
            .map(PathBuf::from)
    }
}

/// Uniform backend contract.
pub trait VolumeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Validate declared options against allowed combinations.
    fn configure(&self, vol: &BackendVolume) -> ArborResult<()>;

    /// Materialize the volume on disk and mount it at `internal`.
    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()>;

    /// Unmount and unlink all storage.
    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()>;

    fn resize(&self, _vol: &mut BackendVolume, _space: u64, _inodes: u64) -> ArborResult<()> {
        Err(ArborError::not_supported(format!(
            "{} volumes cannot be resized",
            self.kind()
        )))
    }

    fn statfs(&self, vol: &BackendVolume) -> ArborResult<FsStat> {
        crate::util::fs::statvfs_info(&vol.path)
    }

    /// Fsck-level validation; default checks the mountpoint exists.
    fn check(&self, vol: &BackendVolume) -> ArborResult<()> {
        if vol.path.exists() {
            Ok(())
        } else {
            Err(ArborError::invalid_path(format!(
                "volume path {} is gone",
                vol.path.display()
            )))
        }
    }

    /// Reopen after a daemon restart; default revalidates options.
    fn restore(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        self.configure(vol)
    }

    /// Place-quota bucket this backend consumes, if any.
    fn claim_place(&self, _vol: &BackendVolume) -> Option<String> {
        Some("total".to_string())
    }
}

/// Pick the implementation for a backend kind.
pub fn backend_for(kind: BackendKind) -> Box<dyn VolumeBackend> {
    match kind {
        BackendKind::Dir => Box::new(dir::DirBackend),
        BackendKind::Plain => Box::new(plain::PlainBackend),
        BackendKind::Bind => Box::new(bind::BindBackend { recursive: false }),
        BackendKind::Rbind => Box::new(bind::BindBackend { recursive: true }),
        BackendKind::Tmpfs => Box::new(tmpfs::TmpfsBackend { huge: false }),
        BackendKind::HugeTmpfs => Box::new(tmpfs::TmpfsBackend { huge: true }),
        BackendKind::Quota => Box::new(quota::QuotaBackend),
        BackendKind::Native => Box::new(native::NativeBackend),
        BackendKind::Overlay => Box::new(overlay::OverlayBackend),
        BackendKind::Loop => Box::new(loopdev::LoopBackend),
        BackendKind::Squash => Box::new(squash::SquashBackend),
        BackendKind::Lvm => Box::new(lvm::LvmBackend),
        BackendKind::Rbd => Box::new(rbd::RbdBackend),
    }
}

pub(crate) fn require(cond: bool, message: impl Into<String>) -> ArborResult<()> {
    if cond {
        Ok(())
    } else {
        Err(ArborError::invalid_value(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(kind_needs: &str) -> BackendVolume {
        BackendVolume {
            id: "7".to_string(),
            path: PathBuf::from("/place/porto_volumes/7/volume"),
            internal: PathBuf::from("/place/porto_volumes/7/volume"),
            storage: if kind_needs == "storage" {
                Some("/data/stuff".to_string())
            } else {
                None
            },
            place: PathBuf::from("/place"),
            temp_dir: PathBuf::from("/place/porto_volumes/7/temp"),
            space_limit: 0,
            inode_limit: 0,
            space_guarantee: 0,
            read_only: false,
            layers: Vec::new(),
            cred_uid: 0,
            cred_gid: 0,
            permissions: 0o775,
            loop_index: -1,
            auto_path: true,
        }
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            BackendKind::Dir,
            BackendKind::Plain,
            BackendKind::Bind,
            BackendKind::Rbind,
            BackendKind::Tmpfs,
            BackendKind::HugeTmpfs,
            BackendKind::Quota,
            BackendKind::Native,
            BackendKind::Overlay,
            BackendKind::Loop,
            BackendKind::Squash,
            BackendKind::Lvm,
            BackendKind::Rbd,
        ] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("ext9".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_default_backend() {
        assert_eq!(BackendKind::default_for(true), BackendKind::Overlay);
        assert_eq!(BackendKind::default_for(false), BackendKind::Native);
    }

    #[test]
    fn test_dir_rejects_options() {
        let backend = backend_for(BackendKind::Dir);
        let mut v = vol("");
        backend.configure(&v).unwrap();
        v.space_limit = 1 << 20;
        assert!(backend.configure(&v).is_err());
        let mut v = vol("");
        v.layers.push(PathBuf::from("/l1"));
        assert!(backend.configure(&v).is_err());
        let mut v = vol("storage");
        v.storage = Some("/data".to_string());
        assert!(backend.configure(&v).is_err());
    }

    #[test]
    fn test_bind_requires_storage() {
        let backend = backend_for(BackendKind::Bind);
        assert!(backend.configure(&vol("")).is_err());
        backend.configure(&vol("storage")).unwrap();
    }

    #[test]
    fn test_tmpfs_requires_space_limit() {
        let backend = backend_for(BackendKind::Tmpfs);
        let mut v = vol("");
        assert!(backend.configure(&v).is_err());
        v.space_limit = 64 << 20;
        backend.configure(&v).unwrap();
    }

    #[test]
    fn test_overlay_requires_layers() {
        let backend = backend_for(BackendKind::Overlay);
        let mut v = vol("");
        assert!(backend.configure(&v).is_err());
        v.layers.push(PathBuf::from("/l1"));
        backend.configure(&v).unwrap();
    }

    #[test]
    fn test_loop_requires_limit_or_image() {
        let backend = backend_for(BackendKind::Loop);
        let v = vol("");
        assert!(backend.configure(&v).is_err());
        let mut v = vol("");
        v.space_limit = 1 << 30;
        backend.configure(&v).unwrap();
        let mut v = vol("storage");
        v.storage = Some("/data/image.img".to_string());
        backend.configure(&v).unwrap();
    }

    #[test]
    fn test_quota_rejects_read_only_and_storage() {
        let backend = backend_for(BackendKind::Quota);
        let mut v = vol("");
        v.space_limit = 1 << 30;
        v.auto_path = false;
        backend.configure(&v).unwrap();
        v.read_only = true;
        assert!(backend.configure(&v).is_err());
        let mut v = vol("storage");
        v.space_limit = 1 << 30;
        v.auto_path = false;
        assert!(backend.configure(&v).is_err());
    }
}
