//! `loop` backend: ext4 image on a loop device.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use arbor_shared::{ArborError, ArborResult, ErrorKind};

use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::helpers::Helper;
use crate::util::fs;

/// Images below this cannot be grown online (kernel advisory).
pub const LOOP_MIN_ONLINE_GROW_BYTES: u64 = 512 << 20;

/// Floor for fresh images; mkfs needs room for its metadata.
pub const MIN_LOOP_IMAGE_BYTES: u64 = 1 << 20;

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_CAPACITY: libc::c_ulong = 0x4C07;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

pub struct LoopBackend;

impl LoopBackend {
    fn image_path(vol: &BackendVolume) -> PathBuf {
        vol.storage_path()
            .unwrap_or_else(|| vol.temp_dir.join("loop.img"))
    }

    fn loop_device(index: i32) -> PathBuf {
        PathBuf::from(format!("/dev/loop{}", index))
    }
}

/// Attach an image file to a free loop device; returns the index.
pub fn attach(image: &Path) -> ArborResult<i32> {
    let control = File::open("/dev/loop-control")
        .map_err(|e| ArborError::from(e).context("opening /dev/loop-control"))?;
    let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if index < 0 {
        return Err(loop_errno("LOOP_CTL_GET_FREE"));
    }
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LoopBackend::loop_device(index))
        .map_err(|e| ArborError::from(e).context(format!("opening loop{}", index)))?;
    let backing = OpenOptions::new()
        .read(true)
        .write(true)
        .open(image)
        .map_err(|e| ArborError::from(e).context(format!("opening {}", image.display())))?;
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd()) };
    if rc != 0 {
        return Err(loop_errno("LOOP_SET_FD"));
    }
    tracing::debug!(index, image = %image.display(), "loop device attached");
    Ok(index)
}

/// Detach a loop device.
pub fn detach(index: i32) -> ArborResult<()> {
    let device = OpenOptions::new()
        .read(true)
        .open(LoopBackend::loop_device(index))
        .map_err(|e| ArborError::from(e).context(format!("opening loop{}", index)))?;
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD, 0) };
    if rc != 0 {
        return Err(loop_errno("LOOP_CLR_FD"));
    }
    Ok(())
}

/// Find a live loop device already backed by `image`.
pub fn find_by_backing(image: &Path) -> Option<i32> {
    let canonical = image.canonicalize().ok()?;
    let entries = std::fs::read_dir("/sys/block").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(index) = name.strip_prefix("loop").and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let backing = entry.path().join("loop/backing_file");
        if let Ok(path) = std::fs::read_to_string(backing) {
            if Path::new(path.trim_end()) == canonical {
                return Some(index);
            }
        }
    }
    None
}

fn loop_errno(what: &str) -> ArborError {
    let err = std::io::Error::last_os_error();
    ArborError::with_errno(
        ErrorKind::Unknown,
        err.raw_os_error().unwrap_or(0),
        format!("{}: {}", what, err),
    )
}

impl VolumeBackend for LoopBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Loop
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(vol.layers.is_empty(), "loop volumes have no layers")?;
        require(
            vol.space_limit > 0 || vol.storage_path().is_some(),
            "loop volumes require a space limit or an existing image",
        )?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let image = Self::image_path(vol);
        let fresh = !image.exists();
        if fresh {
            let size = vol.space_limit.max(MIN_LOOP_IMAGE_BYTES);
            let file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&image)
                .map_err(|e| ArborError::from(e).context("creating loop image"))?;
            file.set_len(size)
                .map_err(|e| ArborError::from(e).context("sizing loop image"))?;
            drop(file);
            if let Err(e) = Helper::new("mkfs.ext4")
                .args(["-q", "-F"])
                .arg(&image)
                .run()
            {
                let _ = std::fs::remove_file(&image);
                return Err(e.context("formatting loop image"));
            }
        }

        let index = attach(&image)?;
        let device = Self::loop_device(index);
        let mount = nix::mount::mount(
            Some(device.as_path()),
            &vol.internal,
            Some("ext4"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        );
        if let Err(errno) = mount {
            let _ = detach(index);
            if fresh {
                let _ = std::fs::remove_file(&image);
            }
            return Err(ArborError::with_errno(
                ErrorKind::Unknown,
                errno as i32,
                format!("mounting loop{} at {}: {}", index, vol.internal.display(), errno),
            ));
        }
        vol.loop_index = index;
        crate::volume::content::apply_ownership(
            &vol.internal,
            vol.cred_uid,
            vol.cred_gid,
            vol.permissions,
        )?;
        if vol.read_only {
            fs::remount_bind(&vol.internal, nix::mount::MsFlags::MS_RDONLY)?;
        }
        Ok(())
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::umount_detach(&vol.internal)?;
        if vol.loop_index >= 0 {
            let _ = detach(vol.loop_index);
            vol.loop_index = -1;
        }
        if vol.storage_path().is_none() {
            let _ = std::fs::remove_file(vol.temp_dir.join("loop.img"));
        }
        Ok(())
    }

    fn resize(&self, vol: &mut BackendVolume, space: u64, inodes: u64) -> ArborResult<()> {
        if inodes > 0 {
            return Err(ArborError::not_supported(
                "loop volumes have no inode limit",
            ));
        }
        if space <= vol.space_limit {
            return Err(ArborError::not_supported(
                "online shrink of a loop volume is not supported",
            ));
        }
        if vol.space_limit < LOOP_MIN_ONLINE_GROW_BYTES {
            return Err(ArborError::not_supported(format!(
                "images below {} bytes cannot be grown online",
                LOOP_MIN_ONLINE_GROW_BYTES
            )));
        }
        let image = Self::image_path(vol);
        let file = OpenOptions::new()
            .write(true)
            .open(&image)
            .map_err(|e| ArborError::from(e).context("opening loop image"))?;
        file.set_len(space)
            .map_err(|e| ArborError::from(e).context("growing loop image"))?;

        if vol.loop_index >= 0 {
            let device = OpenOptions::new()
                .read(true)
                .write(true)
                .open(Self::loop_device(vol.loop_index))
                .map_err(|e| ArborError::from(e).context("opening loop device"))?;
            let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_CAPACITY, 0) };
            if rc != 0 {
                return Err(loop_errno("LOOP_SET_CAPACITY"));
            }
            Helper::new("resize2fs")
                .arg(Self::loop_device(vol.loop_index))
                .deadline(Instant::now() + std::time::Duration::from_secs(300))
                .run()
                .map(|_| ())?;
        }
        vol.space_limit = space;
        Ok(())
    }

    fn restore(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let image = Self::image_path(vol);
        match find_by_backing(&image) {
            Some(index) => {
                vol.loop_index = index;
                Ok(())
            }
            None => Err(ArborError::invalid_state(format!(
                "loop image {} is no longer attached",
                image.display()
            ))),
        }
    }

    fn check(&self, vol: &BackendVolume) -> ArborResult<()> {
        let image = Self::image_path(vol);
        if vol.loop_index >= 0 && !vol.internal.exists() {
            return Err(ArborError::invalid_path("loop mountpoint is gone"));
        }
        Helper::new("e2fsck")
            .args(["-n", "-f"])
            .arg(&image)
            .run()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(space: u64) -> BackendVolume {
        BackendVolume {
            id: "4".into(),
            path: PathBuf::from("/v"),
            internal: PathBuf::from("/v"),
            storage: None,
            place: PathBuf::from("/place"),
            temp_dir: PathBuf::from("/place/t"),
            space_limit: space,
            inode_limit: 0,
            space_guarantee: 0,
            read_only: false,
            layers: Vec::new(),
            cred_uid: 0,
            cred_gid: 0,
            permissions: 0o775,
            loop_index: 0,
            auto_path: true,
        }
    }

    #[test]
    fn test_shrink_rejected() {
        let backend = LoopBackend;
        let mut v = vol(2 << 30);
        let err = backend.resize(&mut v, 1 << 30, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }

    #[test]
    fn test_small_image_cannot_grow_online() {
        let backend = LoopBackend;
        let mut v = vol(256 << 20);
        let err = backend.resize(&mut v, 1 << 30, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }
}
