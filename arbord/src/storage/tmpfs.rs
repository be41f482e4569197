//! `tmpfs` / `hugetmpfs` backends.

use arbor_shared::ArborResult;

use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::util::fs;

pub struct TmpfsBackend {
    pub huge: bool,
}

impl TmpfsBackend {
    fn mount_data(&self, vol: &BackendVolume) -> String {
        let mut data = format!(
            "size={},mode={:o},uid={},gid={}",
            vol.space_limit, vol.permissions, vol.cred_uid, vol.cred_gid
        );
        if vol.inode_limit > 0 {
            data.push_str(&format!(",nr_inodes={}", vol.inode_limit));
        }
        if self.huge {
            data.push_str(",huge=always");
        }
        data
    }
}

impl VolumeBackend for TmpfsBackend {
    fn kind(&self) -> BackendKind {
        if self.huge {
            BackendKind::HugeTmpfs
        } else {
            BackendKind::Tmpfs
        }
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(vol.storage.is_none(), "tmpfs volumes have no storage")?;
        require(vol.layers.is_empty(), "tmpfs volumes have no layers")?;
        require(vol.space_limit > 0, "tmpfs volumes require a space limit")?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::mount_tmpfs(&vol.internal, &self.mount_data(vol))
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::umount_detach(&vol.internal)
    }

    fn resize(&self, vol: &mut BackendVolume, space: u64, inodes: u64) -> ArborResult<()> {
        // tmpfs accepts live remount with a new size.
        let mut data = format!("size={}", space);
        if inodes > 0 {
            data.push_str(&format!(",nr_inodes={}", inodes));
        }
        nix::mount::mount(
            None::<&str>,
            &vol.internal,
            None::<&str>,
            nix::mount::MsFlags::MS_REMOUNT,
            Some(data.as_str()),
        )
        .map_err(|e| {
            arbor_shared::ArborError::with_errno(
                arbor_shared::ErrorKind::Unknown,
                e as i32,
                format!("remounting tmpfs {}: {}", vol.internal.display(), e),
            )
        })?;
        vol.space_limit = space;
        if inodes > 0 {
            vol.inode_limit = inodes;
        }
        Ok(())
    }

    fn claim_place(&self, _vol: &BackendVolume) -> Option<String> {
        // Pages live in RAM, not in the place.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_mount_data() {
        let vol = BackendVolume {
            id: "1".into(),
            path: PathBuf::from("/v"),
            internal: PathBuf::from("/v"),
            storage: None,
            place: PathBuf::from("/place"),
            temp_dir: PathBuf::from("/place/t"),
            space_limit: 64 << 20,
            inode_limit: 1000,
            space_guarantee: 0,
            read_only: false,
            layers: Vec::new(),
            cred_uid: 5,
            cred_gid: 6,
            permissions: 0o750,
            loop_index: -1,
            auto_path: true,
        };
        let data = TmpfsBackend { huge: false }.mount_data(&vol);
        assert_eq!(data, "size=67108864,mode=750,uid=5,gid=6,nr_inodes=1000");
        let data = TmpfsBackend { huge: true }.mount_data(&vol);
        assert!(data.ends_with(",huge=always"));
    }
}
