//! `native` backend: project quota (when limits are set) plus a
//! bindmount of the storage directory.

use arbor_shared::{ArborError, ArborResult};

use super::quota::proj::ProjectQuota;
use super::{BackendKind, BackendVolume, VolumeBackend};
use crate::util::fs;
use crate::util::fs::FsStat;

pub struct NativeBackend;

impl NativeBackend {
    fn storage_dir(vol: &BackendVolume) -> std::path::PathBuf {
        vol.storage_path()
            .unwrap_or_else(|| vol.temp_dir.join("native"))
    }
}

impl VolumeBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn configure(&self, _vol: &BackendVolume) -> ArborResult<()> {
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let storage = Self::storage_dir(vol);
        std::fs::create_dir_all(&storage)
            .map_err(|e| ArborError::from(e).context("creating native storage"))?;
        crate::volume::content::apply_ownership(
            &storage,
            vol.cred_uid,
            vol.cred_gid,
            vol.permissions,
        )?;

        if vol.space_limit > 0 || vol.inode_limit > 0 {
            let quota = ProjectQuota::for_dir(&storage)?;
            match quota.enable(vol.space_limit, vol.inode_limit) {
                Ok(()) => {}
                Err(e) if e.kind == arbor_shared::ErrorKind::NotSupported => {
                    tracing::warn!(
                        volume = %vol.id,
                        "filesystem has no project quota, limits not enforced"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        fs::bind_mount(&storage, &vol.internal, false)?;
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
                    st.inode_used = usage.inode_used;
                }
            }
        }
        Ok(st)
    }
}
