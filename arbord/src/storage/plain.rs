//! `plain` backend: bindmount the storage directory over the volume.

use arbor_shared::{ArborError, ArborResult};

use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::util::fs;

pub struct PlainBackend;

impl VolumeBackend for PlainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Plain
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(
            vol.space_limit == 0 && vol.inode_limit == 0,
            "plain volumes have no quota",
        )?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let storage = vol
            .storage_path()
            .unwrap_or_else(|| vol.temp_dir.join("storage"));
        std::fs::create_dir_all(&storage)
            .map_err(|e| ArborError::from(e).context("creating plain storage"))?;
        crate::volume::content::apply_ownership(
            &storage,
            vol.cred_uid,
            vol.cred_gid,
            vol.permissions,
        )?;
        fs::bind_mount(&storage, &vol.internal, false)?;
        if vol.read_only {
            fs::remount_bind(&vol.internal, nix::mount::MsFlags::MS_RDONLY)?;
        }
        Ok(())
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::umount_detach(&vol.internal)?;
        if vol.storage_path().is_none() {
            let _ = std::fs::remove_dir_all(vol.temp_dir.join("storage"));
        }
        Ok(())
    }
}
