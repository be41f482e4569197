//! `bind` / `rbind` backends: bindmount external storage, nothing owned.

use arbor_shared::ArborResult;

use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::util::fs;

pub struct BindBackend {
    pub recursive: bool,
}

impl VolumeBackend for BindBackend {
    fn kind(&self) -> BackendKind {
        if self.recursive {
            BackendKind::Rbind
        } else {
            BackendKind::Bind
        }
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(
            vol.storage_path().is_some(),
            "bind volumes require external storage",
        )?;
        require(vol.layers.is_empty(), "bind volumes have no layers")?;
        require(
            vol.space_limit == 0 && vol.inode_limit == 0,
            "bind volumes have no quota",
        )?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let storage = vol.storage_path().expect("checked in configure");
        fs::bind_mount(&storage, &vol.internal, self.recursive)?;
        if vol.read_only {
            fs::remount_bind(&vol.internal, nix::mount::MsFlags::MS_RDONLY)?;
        }
        Ok(())
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::umount_detach(&vol.internal)
    }

    fn claim_place(&self, _vol: &BackendVolume) -> Option<String> {
        // Externally owned bytes are not charged to the place.
        None
    }
}
