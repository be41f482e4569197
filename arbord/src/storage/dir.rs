//! `dir` backend: the path itself is the storage, no mount at all.

use arbor_shared::ArborResult;

use super::{require, BackendKind, BackendVolume, VolumeBackend};

pub struct DirBackend;

impl VolumeBackend for DirBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Dir
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(vol.storage.is_none(), "dir volumes have no storage")?;
        require(vol.layers.is_empty(), "dir volumes have no layers")?;
        require(
            vol.space_limit == 0 && vol.inode_limit == 0,
            "dir volumes have no quota",
        )?;
        require(!vol.read_only, "dir volumes cannot be read-only")?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        std::fs::create_dir_all(&vol.path)
            .map_err(|e| arbor_shared::ArborError::from(e).context("creating dir volume"))?;
        crate::volume::content::apply_ownership(&vol.path, vol.cred_uid, vol.cred_gid, vol.permissions)
    }

    fn destroy(&self, _vol: &mut BackendVolume) -> ArborResult<()> {
        // The directory belongs to the caller; nothing to unmount.
        Ok(())
    }

    fn claim_place(&self, _vol: &BackendVolume) -> Option<String> {
        None
    }
}
