//! `overlay` backend: project-quota'd upper/work over read-only layers.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use arbor_shared::{ArborError, ArborResult, ErrorKind};

use super::quota::proj::ProjectQuota;
use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::util::fs;
use crate::util::fs::FsStat;

/// Kernels reject absurd lowerdir counts with a bare EINVAL; surface a
/// readable error instead.
pub const TOO_MANY_LAYERS: usize = 500;

pub struct OverlayBackend;

impl OverlayBackend {
    fn storage_dir(vol: &BackendVolume) -> PathBuf {
        vol.storage_path()
            .unwrap_or_else(|| vol.temp_dir.join("overlay"))
    }

    /// Lowerdir list for the kernel: top to bottom, deduplicated by
    /// (dev, ino) so a layer named twice is mounted once.
    fn lowerdirs(vol: &BackendVolume) -> ArborResult<Vec<PathBuf>> {
        let mut seen: HashSet<(u64, u64)> = HashSet::new();
        let mut dirs = Vec::new();
        // A populated cow branch goes topmost so first writes COW from it.
        let cow = vol.temp_dir.join("cow");
        if cow.is_dir() {
            dirs.push(cow.clone());
            if let Ok(meta) = std::fs::metadata(&cow) {
                seen.insert((meta.dev(), meta.ino()));
            }
        }
        for layer in vol.layers.iter().rev() {
            let meta = std::fs::metadata(layer)
                .map_err(|e| ArborError::from(e).context(format!("layer {}", layer.display())))?;
            if seen.insert((meta.dev(), meta.ino())) {
                dirs.push(layer.clone());
            }
        }
        Ok(dirs)
    }
}

impl VolumeBackend for OverlayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Overlay
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(!vol.layers.is_empty(), "overlay volumes require layers")?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let storage = Self::storage_dir(vol);
        let upper = storage.join("upper");
        let work = storage.join("work");
        std::fs::create_dir_all(&upper)
            .map_err(|e| ArborError::from(e).context("creating overlay upper"))?;
        std::fs::create_dir_all(&work)
            .map_err(|e| ArborError::from(e).context("creating overlay work"))?;
        crate::volume::content::apply_ownership(
            &upper,
            vol.cred_uid,
            vol.cred_gid,
            vol.permissions,
        )?;

        if vol.space_limit > 0 || vol.inode_limit > 0 {
            let quota = ProjectQuota::for_dir(&storage)?;
            match quota.enable(vol.space_limit, vol.inode_limit) {
                Ok(()) => {}
                Err(e) if e.kind == ErrorKind::NotSupported => {
                    tracing::warn!(volume = %vol.id, "no project quota for overlay upper");
                }
                Err(e) => return Err(e),
            }
        }

        let lower = Self::lowerdirs(vol)?;
        match fs::mount_overlay(&vol.internal, &lower, &upper, &work) {
            Ok(()) => {}
            Err(e) if e.errno == Some(libc::EINVAL) && lower.len() >= TOO_MANY_LAYERS => {
                return Err(ArborError::new(
                    ErrorKind::NotSupported,
                    format!("too many layers: {}", lower.len()),
                ));
            }
            Err(e) => return Err(e),
        }

        if vol.read_only {
            fs::remount_bind(&vol.internal, nix::mount::MsFlags::MS_RDONLY)?;
        }
        Ok(())
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::umount_detach(&vol.internal)?;
        let storage = Self::storage_dir(vol);
        if let Ok(quota) = ProjectQuota::for_dir(&storage) {
            let _ = quota.disable();
        }
        if vol.storage_path().is_none() {
            let _ = std::fs::remove_dir_all(&storage);
        }
        Ok(())
    }

    fn resize(&self, vol: &mut BackendVolume, space: u64, inodes: u64) -> ArborResult<()> {
        let quota = ProjectQuota::for_dir(&Self::storage_dir(vol))?;
        quota.set_limits(space, inodes)?;
        vol.space_limit = space;
        vol.inode_limit = inodes;
        Ok(())
    }

    fn statfs(&self, vol: &BackendVolume) -> ArborResult<FsStat> {
        let mut st = fs::statvfs_info(&vol.path)?;
        if vol.space_limit > 0 {
            if let Ok(quota) = ProjectQuota::for_dir(&Self::storage_dir(vol)) {
                if let Ok(usage) = quota.usage() {
                    st.space_total = vol.space_limit;
                    st.space_used = usage.space_used;
                    st.space_avail = vol.space_limit.saturating_sub(usage.space_used);
                }
            }
        }
        Ok(st)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vol_with_layers(layers: Vec<PathBuf>, temp_dir: PathBuf) -> BackendVolume {
        BackendVolume {
            id: "9".into(),
            path: PathBuf::from("/v"),
            internal: PathBuf::from("/v"),
            storage: None,
            place: PathBuf::from("/place"),
            temp_dir,
            space_limit: 0,
            inode_limit: 0,
            space_guarantee: 0,
            read_only: false,
            layers,
            cred_uid: 0,
            cred_gid: 0,
            permissions: 0o775,
            loop_index: -1,
            auto_path: true,
        }
    }

    #[test]
    fn test_lowerdirs_dedup_by_dev_ino() {
        let dir = TempDir::new().unwrap();
        let l1 = dir.path().join("l1");
        let l2 = dir.path().join("l2");
        std::fs::create_dir_all(&l1).unwrap();
        std::fs::create_dir_all(&l2).unwrap();
        // The same layer named twice (bottom and top).
        let vol = vol_with_layers(
            vec![l1.clone(), l2.clone(), l1.clone()],
            dir.path().join("temp"),
        );
        let lower = OverlayBackend::lowerdirs(&vol).unwrap();
        assert_eq!(lower.len(), 2);
        // Top-to-bottom order for the kernel: the duplicate keeps its
        // topmost position.
        assert_eq!(lower, vec![l1, l2]);
    }

    #[test]
    fn test_lowerdirs_include_cow_branch_first() {
        let dir = TempDir::new().unwrap();
        let l1 = dir.path().join("l1");
        std::fs::create_dir_all(&l1).unwrap();
        let temp = dir.path().join("temp");
        std::fs::create_dir_all(temp.join("cow")).unwrap();
        let vol = vol_with_layers(vec![l1.clone()], temp.clone());
        let lower = OverlayBackend::lowerdirs(&vol).unwrap();
        assert_eq!(lower, vec![temp.join("cow"), l1]);
    }

    #[test]
    fn test_lowerdirs_missing_layer_errors() {
        let dir = TempDir::new().unwrap();
        let vol = vol_with_layers(vec![dir.path().join("gone")], dir.path().join("temp"));
        assert!(OverlayBackend::lowerdirs(&vol).is_err());
    }
}
