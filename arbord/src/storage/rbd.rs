//! `rbd` backend: Ceph rados block devices.
//!
//! The storage descriptor is `id@pool/image`; the image is mapped with
//! the rbd tooling and mounted as ext4.

use std::path::PathBuf;

use arbor_shared::{ArborError, ArborResult};

use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::helpers::Helper;
use crate::util::fs;

/// Parsed `storage` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbdSpec {
    pub id: String,
    pub pool: String,
    pub image: String,
}

impl RbdSpec {
    pub fn parse(storage: &str) -> ArborResult<RbdSpec> {
        let (id, rest) = storage.split_once('@').ok_or_else(|| {
            ArborError::invalid_value(format!("rbd storage {:?}, want id@pool/image", storage))
        })?;
        let (pool, image) = rest.split_once('/').ok_or_else(|| {
            ArborError::invalid_value(format!("rbd storage {:?}, want id@pool/image", storage))
        })?;
        if id.is_empty() || pool.is_empty() || image.is_empty() {
            return Err(ArborError::invalid_value(format!(
                "rbd storage {:?} has empty fields",
                storage
            )));
        }
        Ok(RbdSpec {
            id: id.to_string(),
            pool: pool.to_string(),
            image: image.to_string(),
        })
    }

    pub fn image_spec(&self) -> String {
        format!("{}/{}", self.pool, self.image)
    }
}

pub struct RbdBackend;

impl VolumeBackend for RbdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rbd
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(vol.layers.is_empty(), "rbd volumes have no layers")?;
        RbdSpec::parse(vol.storage.as_deref().unwrap_or(""))?;
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let spec = RbdSpec::parse(vol.storage.as_deref().unwrap_or(""))?;
        let device = Helper::new("rbd")
            .args(["map", "--id", &spec.id])
            .arg(spec.image_spec())
            .run()
            .map_err(|e| e.context("rbd map"))?;
        let device = PathBuf::from(device.trim());

        let mounted = nix::mount::mount(
            Some(device.as_path()),
            &vol.internal,
            Some("ext4"),
            if vol.read_only {
                nix::mount::MsFlags::MS_RDONLY
            } else {
                nix::mount::MsFlags::empty()
            },
            None::<&str>,
        );
        if let Err(errno) = mounted {
            let _ = Helper::new("rbd").arg("unmap").arg(&device).run();
            return Err(ArborError::with_errno(
                arbor_shared::ErrorKind::Unknown,
                errno as i32,
                format!("mounting {}: {}", device.display(), errno),
            ));
        }
        Ok(())
    }

    fn destroy(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        fs::umount_detach(&vol.internal)?;
        let spec = RbdSpec::parse(vol.storage.as_deref().unwrap_or(""))?;
        Helper::new("rbd")
            .args(["unmap", "--id", &spec.id])
            .arg(spec.image_spec())
            .run()
            .map(|_| ())
            .map_err(|e| e.context("rbd unmap"))
    }

    fn claim_place(&self, _vol: &BackendVolume) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let spec = RbdSpec::parse("admin@rbd/backup").unwrap();
        assert_eq!(spec.id, "admin");
        assert_eq!(spec.pool, "rbd");
        assert_eq!(spec.image, "backup");
        assert_eq!(spec.image_spec(), "rbd/backup");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "rbd/backup", "admin@rbd", "@rbd/x", "a@/x", "a@p/"] {
            assert!(RbdSpec::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }
}
