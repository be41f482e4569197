//! `lvm` backend: logical volumes via the lvm2 tooling.
//!
//! The storage descriptor is `[group][/name][@thin][:origin]`. A named
//! lv is persistent; an unnamed one is created per volume and removed
//! with it.

use std::path::PathBuf;

use arbor_shared::{ArborError, ArborResult};

use super::{require, BackendKind, BackendVolume, VolumeBackend};
use crate::helpers::Helper;
use crate::util::fs;

/// Parsed `storage` descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LvmSpec {
    pub group: String,
    pub name: String,
    pub thin_pool: String,
    pub origin: String,
}

impl LvmSpec {
    pub fn parse(storage: &str) -> ArborResult<LvmSpec> {
        let mut spec = LvmSpec::default();
        let mut rest = storage;
        if let Some((head, origin)) = rest.split_once(':') {
            spec.origin = origin.to_string();
            rest = head;
        }
        if let Some((head, thin)) = rest.split_once('@') {
            spec.thin_pool = thin.to_string();
            rest = head;
        }
        match rest.split_once('/') {
            Some((group, name)) => {
                spec.group = group.to_string();
                spec.name = name.to_string();
            }
            None => spec.group = rest.to_string(),
        }
        if spec.group.is_empty() {
            return Err(ArborError::invalid_value(format!(
                "lvm storage {:?} names no volume group",
                storage
            )));
        }
        Ok(spec)
    }

    /// Whether the lv outlives the volume.
    pub fn persistent(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn device(&self, volume_id: &str) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.group, self.lv_name(volume_id)))
    }

    pub fn lv_name(&self, volume_id: &str) -> String {
        if self.name.is_empty() {
            format!("arbor_lv_{}", volume_id)
        } else {
            self.name.clone()
        }
    }
}

pub struct LvmBackend;

impl VolumeBackend for LvmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lvm
    }

    fn configure(&self, vol: &BackendVolume) -> ArborResult<()> {
        require(vol.layers.is_empty(), "lvm volumes have no layers")?;
        let spec = LvmSpec::parse(vol.storage.as_deref().unwrap_or(""))?;
        if !spec.persistent() {
            require(
                vol.space_limit > 0,
                "transient lvm volumes require a space limit",
            )?;
        }
        Ok(())
    }

    fn build(&self, vol: &mut BackendVolume) -> ArborResult<()> {
        let spec = LvmSpec::parse(vol.storage.as_deref().unwrap_or(""))?;
        let lv = spec.lv_name(&vol.id);
        let device = spec.device(&vol.id);

        if !device.exists() {
            let size = format!("{}b", vol.space_limit);
            let helper = if !spec.origin.is_empty() {
                // Snapshot of an existing lv.
                Helper::new("lvm").args([
                    "lvcreate",
                    "--snapshot",
                    "--name",
                    &lv,
                    "--size",
                    &size,
                    &format!("{}/{}", spec.group, spec.origin),
                ])
            } else if !spec.thin_pool.is_empty() {
                Helper::new("lvm").args([
                    "lvcreate",
                    "--thin",
                    "--name",
                    &lv,
                    "--virtualsize",
                    &size,
                    &format!("{}/{}", spec.group, spec.thin_pool),
                ])
            } else {
                Helper::new("lvm").args([
                    "lvcreate",
                    "--name",
                    &lv,
                    "--size",
                    &size,
                    &spec.group,
                ])
            };
            helper.run().map(|_| ()).map_err(|e| e.context("lvcreate"))?;

            if spec.origin.is_empty() {
                if let Err(e) = Helper::new("mkfs.ext4").args(["-q", "-F"]).arg(&device).run() {
                    let _ = Helper::new("lvm")
                        .args(["lvremove", "--force", &format!("{}/{}", spec.group, lv)])
                        .run();
                    return Err(e.context("formatting lvm volume"));
                }
            }
        }

        nix::mount::mount(
            Some(device.as_path()),
            &vol.internal,
            Some("ext4"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| {
            ArborError::with_errno(
                arbor_shared::ErrorKind::Unknown,
                e as i32,
                format!("mounting {}: {}", device.display(), e),
            )
        })?;
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
        let spec = LvmSpec::parse(vol.storage.as_deref().unwrap_or(""))?;
        if !spec.persistent() {
            Helper::new("lvm")
                .args([
                    "lvremove",
                    "--force",
                    &format!("{}/{}", spec.group, spec.lv_name(&vol.id)),
                ])
                .run()
                .map(|_| ())
                .map_err(|e| e.context("lvremove"))?;
        }
        Ok(())
    }

    fn resize(&self, vol: &mut BackendVolume, space: u64, inodes: u64) -> ArborResult<()> {
        if inodes > 0 {
            return Err(ArborError::not_supported("lvm volumes have no inode limit"));
        }
        let spec = LvmSpec::parse(vol.storage.as_deref().unwrap_or(""))?;
        let device = spec.device(&vol.id);
        Helper::new("lvm")
            .args([
                "lvresize",
                "--force",
                "--resizefs",
                "--size",
                &format!("{}b", space),
            ])
            .arg(&device)
            .run()
            .map(|_| ())
            .map_err(|e| e.context("lvresize"))?;
        vol.space_limit = space;
        Ok(())
    }

    fn claim_place(&self, _vol: &BackendVolume) -> Option<String> {
        // The bytes live in the volume group, not under the place.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_descriptor() {
        let spec = LvmSpec::parse("vg0/data@pool0:base").unwrap();
        assert_eq!(spec.group, "vg0");
        assert_eq!(spec.name, "data");
        assert_eq!(spec.thin_pool, "pool0");
        assert_eq!(spec.origin, "base");
        assert!(spec.persistent());
    }

    #[test]
    fn test_parse_group_only() {
        let spec = LvmSpec::parse("vg0").unwrap();
        assert_eq!(spec.group, "vg0");
        assert!(!spec.persistent());
        assert_eq!(spec.lv_name("12"), "arbor_lv_12");
        assert_eq!(spec.device("12"), PathBuf::from("/dev/vg0/arbor_lv_12"));
    }

    #[test]
    fn test_parse_empty_rejected() {
        assert!(LvmSpec::parse("").is_err());
        assert!(LvmSpec::parse("@pool").is_err());
    }
}
