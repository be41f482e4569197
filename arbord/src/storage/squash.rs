//! `squash` backend: squashfs image as the bottom layer, overlay upper
//! on top when writable.

use std::path::PathBuf;

use arbor_shared::{ArborError, ArborResult};

use super::loopdev;
use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::util::fs;

pub struct SquashBackend;

impl SquashBackend {
    fn image(vol: &BackendVolume) -> ArborResult<PathBuf> {
        vol.layers
            .first()
            .cloned()
            .ok_or_else(|| ArborError::invalid_value("squash volumes require layers[0]"))
    }

    fn squash_slot(vol: &BackendVolume) -> PathBuf {
        vol.temp_dir.join("squash")
    }
}

impl VolumeBackend for SquashBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Squash
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        let image = Self::image(vol)?;
        require(
            image.extension().is_some() || image.is_file() || !image.exists(),
            "layers[0] must be a squashfs image file",
        )?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let image = Self::image(vol)?;
        if !image.is_file() {
            return Err(ArborError::invalid_path(format!(
                "squashfs image {} not found",
                image.display()
            )));
        }
        let slot = Self::squash_slot(vol);
        std::fs::create_dir_all(&slot)
            .map_err(|e| ArborError::from(e).context("creating squash slot"))?;

        let index = loopdev::attach(&image)?;
        let device = PathBuf::from(format!("/dev/loop{}", index));
        let mounted = nix::mount::mount(
            Some(device.as_path()),
            &slot,
            Some("squashfs"),
            nix::mount::MsFlags::MS_RDONLY,
            None::<&str>,
        );
        if let Err(errno) = mounted {
            let _ = loopdev::detach(index);
            return Err(ArborError::with_errno(
                arbor_shared::ErrorKind::Unknown,
                errno as i32,
                format!("mounting squashfs: {}", errno),
            ));
        }
        vol.loop_index = index;

        if vol.read_only && vol.layers.len() == 1 {
            fs::bind_mount(&slot, &vol.internal, false)?;
            fs::remount_bind(&vol.internal, nix::mount::MsFlags::MS_RDONLY)?;
            return Ok(());
        }

        // Writable squash: overlay with the squash mount as the bottom
        // layer below any extra layers.
        let upper = vol.temp_dir.join("upper");
        let work = vol.temp_dir.join("work");
        std::fs::create_dir_all(&upper)
            .map_err(|e| ArborError::from(e).context("creating squash upper"))?;
        std::fs::create_dir_all(&work)
            .map_err(|e| ArborError::from(e).context("creating squash work"))?;
        let mut lower: Vec<PathBuf> = vol.layers[1..].iter().rev().cloned().collect();
        lower.push(slot);
        fs::mount_overlay(&vol.internal, &lower, &upper, &work)?;
        crate::volume::content::apply_ownership(
            &vol.internal,
            vol.cred_uid,
            vol.cred_gid,
            vol.permissions,
        )?;
        Ok(())
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::umount_detach(&vol.internal)?;
        let _ = fs::umount_detach(&Self::squash_slot(vol));
        if vol.loop_index >= 0 {
            let _ = loopdev::detach(vol.loop_index);
            vol.loop_index = -1;
        }
        Ok(())
    }
}
