//! Volume objects.
//!
//! A volume is an independently owned unit of storage exposed as a host
//! path. Volumes live in an arena with generational handles; the engine
//! in [`engine`] owns the maps, links, accounting and lifecycle.

pub mod content;
pub mod engine;
pub mod layer;
pub mod place;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use arbor_shared::{ArborError, ArborResult};

use crate::container::CtId;
use crate::kv::KvRecord;
use crate::storage::{BackendKind, BackendVolume};
use content::VolumeContent;

/// Generational volume handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolId {
    pub index: u32,
    pub gen: u32,
}

/// Volume lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolState {
    Initial,
    Building,
    Ready,
    Tuning,
    Unlinked,
    ToDestroy,
    Destroying,
    Destroyed,
}

impl VolState {
    pub fn as_str(self) -> &'static str {
        match self {
            VolState::Initial => "initial",
            VolState::Building => "building",
            VolState::Ready => "ready",
            VolState::Tuning => "tuning",
            VolState::Unlinked => "unlinked",
            VolState::ToDestroy => "to-destroy",
            VolState::Destroying => "destroying",
            VolState::Destroyed => "destroyed",
        }
    }

    /// Readable by observers (links, statfs, list).
    pub fn is_observable(self) -> bool {
        matches!(self, VolState::Ready | VolState::Tuning)
    }

    pub fn is_dying(self) -> bool {
        matches!(
            self,
            VolState::Unlinked | VolState::ToDestroy | VolState::Destroying | VolState::Destroyed
        )
    }
}

impl FromStr for VolState {
    type Err = ArborError;

    fn from_str(s: &str) -> ArborResult<Self> {
        match s {
            "initial" => Ok(VolState::Initial),
            "building" => Ok(VolState::Building),
            "ready" => Ok(VolState::Ready),
            "tuning" => Ok(VolState::Tuning),
            "unlinked" => Ok(VolState::Unlinked),
            "to-destroy" => Ok(VolState::ToDestroy),
            "destroying" => Ok(VolState::Destroying),
            "destroyed" => Ok(VolState::Destroyed),
            other => Err(ArborError::invalid_value(format!(
                "unknown volume state {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for VolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One container-facing mount binding of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLink {
    pub ct: CtId,
    /// Container name at link time, for persistence and listing.
    pub ct_name: String,
    /// Mount target inside the container root; empty links carry no
    /// mount of their own.
    pub target: PathBuf,
    pub read_only: bool,
    /// Required links stop the container when the volume goes away.
    pub required: bool,
    /// Absolute host path of the mounted link; empty while unmounted.
    pub host_target: PathBuf,
}

impl VolumeLink {
    pub fn is_mounted(&self) -> bool {
        !self.host_target.as_os_str().is_empty()
    }

    fn to_kv(&self) -> String {
        let target = if self.target.as_os_str().is_empty() {
            Path::new("-")
        } else {
            self.target.as_path()
        };
        format!(
            "{} {} {} {} {}",
            self.ct_name,
            target.display(),
            if self.read_only { "ro" } else { "rw" },
            if self.required { "!" } else { "." },
            self.host_target.display(),
        )
    }

    fn from_kv(line: &str) -> ArborResult<(String, PathBuf, bool, bool, PathBuf)> {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() < 4 {
            return Err(ArborError::invalid_data(format!("bad link record {:?}", line)));
        }
        let target = if words[1] == "-" {
            PathBuf::new()
        } else {
            PathBuf::from(words[1])
        };
        let host_target = words
            .get(4)
            .map(PathBuf::from)
            .unwrap_or_default();
        Ok((
            words[0].to_string(),
            target,
            words[2] == "ro",
            words[3] == "!",
            host_target,
        ))
    }
}

/// Declared, parsed volume configuration.
#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub backend: Option<BackendKind>,
    pub storage: Option<String>,
    pub layers: Vec<String>,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub space_guarantee: u64,
    pub read_only: bool,
    pub permissions: u32,
    pub cred_uid: Option<u32>,
    pub cred_gid: Option<u32>,
    pub private: String,
    pub place: Option<PathBuf>,
    pub owner_container: Option<String>,
    pub content: VolumeContent,
}

impl VolumeSpec {
    pub fn parse(properties: &HashMap<String, String>) -> ArborResult<VolumeSpec> {
        let mut spec = VolumeSpec {
            permissions: 0o775,
            ..Default::default()
        };
        for (key, value) in properties {
            match key.as_str() {
                "backend" => spec.backend = Some(value.parse()?),
                "storage" => {
                    if !value.is_empty() {
                        spec.storage = Some(value.clone());
                    }
                }
                "layers" => {
                    spec.layers = value
                        .split(';')
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "space_limit" => {
                    spec.space_limit = crate::container::property::parse_size(value)?
                }
                "inode_limit" => {
                    spec.inode_limit = crate::container::property::parse_size(value)?
                }
                "space_guarantee" => {
                    spec.space_guarantee = crate::container::property::parse_size(value)?
                }
                "read_only" => spec.read_only = crate::container::property::parse_bool(value)?,
                "permissions" => {
                    spec.permissions = u32::from_str_radix(value, 8).map_err(|_| {
                        ArborError::invalid_value(format!("bad permissions {:?}", value))
                    })?;
                }
                "user" => {
                    spec.cred_uid = Some(value.parse().map_err(|_| {
                        ArborError::invalid_value(format!("bad volume user {:?}", value))
                    })?)
                }
                "group" => {
                    spec.cred_gid = Some(value.parse().map_err(|_| {
                        ArborError::invalid_value(format!("bad volume group {:?}", value))
                    })?)
                }
                "private" => spec.private = value.clone(),
                "place" => spec.place = Some(PathBuf::from(value)),
                "container" => spec.owner_container = Some(value.clone()),
                "dirs" => spec.content.dirs = VolumeContent::parse_dirs(value)?,
                "symlinks" => spec.content.symlinks = VolumeContent::parse_symlinks(value)?,
                "shares" => spec.content.shares = VolumeContent::parse_shares(value)?,
                other => {
                    return Err(ArborError::invalid_property(format!(
                        "unknown volume property {:?}",
                        other
                    )))
                }
            }
        }
        Ok(spec)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend
            .unwrap_or_else(|| BackendKind::default_for(!self.layers.is_empty()))
    }
}

/// One volume.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Monotonically allocated decimal id string.
    pub id: String,
    pub state: VolState,
    pub backend: BackendKind,
    /// Host-side mountpoint.
    pub path: PathBuf,
    /// Canonical mount under the place's internal tree.
    pub internal_path: PathBuf,
    pub storage: Option<String>,
    pub place: PathBuf,
    pub owner_ct: CtId,
    pub owner_ct_name: String,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub cred_uid: u32,
    pub cred_gid: u32,
    pub permissions: u32,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub space_guarantee: u64,
    pub read_only: bool,
    /// Declared layers, bottom to top: names or absolute paths.
    pub layers: Vec<String>,
    /// Resolved lower directories at build time.
    pub resolved_layers: Vec<PathBuf>,
    pub private: String,
    pub content: VolumeContent,
    pub build_time_ms: u64,
    pub change_time_ms: u64,
    pub loop_index: i32,
    /// Charge held against the owner chain's place quota.
    pub claimed_space: u64,
    /// Volumes whose storage, layers or path live under this volume.
    pub nested: Vec<VolId>,
    pub links: Vec<VolumeLink>,
    /// Auto path under the place rather than caller-chosen.
    pub auto_path: bool,
}

impl Volume {
    /// Backend-facing view.
    pub fn backend_volume(&self) -> BackendVolume {
        BackendVolume {
            id: self.id.clone(),
            path: self.path.clone(),
            internal: self.internal_path.clone(),
            storage: self.storage.clone(),
            place: self.place.clone(),
            temp_dir: self.temp_dir(),
            space_limit: self.space_limit,
            inode_limit: self.inode_limit,
            space_guarantee: self.space_guarantee,
            read_only: self.read_only,
            layers: self.resolved_layers.clone(),
            cred_uid: self.cred_uid,
            cred_gid: self.cred_gid,
            permissions: self.permissions,
            loop_index: self.loop_index,
            auto_path: self.auto_path,
        }
    }

    /// Per-volume directory under the place.
    pub fn volume_dir(&self) -> PathBuf {
        self.place.join(place::VOLUMES_DIR).join(&self.id)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.volume_dir().join("temp")
    }

    pub fn to_record(&self) -> KvRecord {
        let mut record = KvRecord::new();
        record.insert("id".into(), self.id.clone());
        record.insert("state".into(), self.state.to_string());
        record.insert("backend".into(), self.backend.to_string());
        record.insert("path".into(), self.path.display().to_string());
        record.insert(
            "internal_path".into(),
            self.internal_path.display().to_string(),
        );
        if let Some(storage) = &self.storage {
            record.insert("storage".into(), storage.clone());
        }
        record.insert("place".into(), self.place.display().to_string());
        record.insert("owner_container".into(), self.owner_ct_name.clone());
        record.insert("owner_user".into(), self.owner_uid.to_string());
        record.insert("owner_group".into(), self.owner_gid.to_string());
        record.insert("user".into(), self.cred_uid.to_string());
        record.insert("group".into(), self.cred_gid.to_string());
        record.insert("permissions".into(), format!("{:o}", self.permissions));
        record.insert("space_limit".into(), self.space_limit.to_string());
        record.insert("inode_limit".into(), self.inode_limit.to_string());
        record.insert("space_guarantee".into(), self.space_guarantee.to_string());
        record.insert("read_only".into(), self.read_only.to_string());
        record.insert("layers".into(), self.layers.join(";"));
        record.insert("private".into(), self.private.clone());
        record.insert("build_time_ms".into(), self.build_time_ms.to_string());
        record.insert("loop_index".into(), self.loop_index.to_string());
        record.insert("claimed_space".into(), self.claimed_space.to_string());
        record.insert("auto_path".into(), self.auto_path.to_string());
        for (i, link) in self.links.iter().enumerate() {
            record.insert(format!("link_{}", i), link.to_kv());
        }
        record
    }

    /// Rebuild from a KV record; container handles are resolved later.
    pub fn from_record(record: &KvRecord) -> ArborResult<(Volume, Vec<(String, PathBuf, bool, bool, PathBuf)>)> {
        let get = |key: &str| -> ArborResult<&String> {
            record
                .get(key)
                .ok_or_else(|| ArborError::invalid_data(format!("volume record misses {}", key)))
        };
        let parse_u64 = |key: &str| -> u64 {
            record
                .get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };

        let mut links = Vec::new();
        let mut i = 0;
        while let Some(line) = record.get(&format!("link_{}", i)) {
            links.push(VolumeLink::from_kv(line)?);
            i += 1;
        }

        let volume = Volume {
            id: get("id")?.clone(),
            state: get("state")?.parse()?,
            backend: get("backend")?.parse()?,
            path: PathBuf::from(get("path")?),
            internal_path: PathBuf::from(get("internal_path")?),
            storage: record.get("storage").cloned(),
            place: PathBuf::from(get("place")?),
            owner_ct: CtId { index: 0, gen: 0 },
            owner_ct_name: get("owner_container")?.clone(),
            owner_uid: parse_u64("owner_user") as u32,
            owner_gid: parse_u64("owner_group") as u32,
            cred_uid: parse_u64("user") as u32,
            cred_gid: parse_u64("group") as u32,
            permissions: record
                .get("permissions")
                .and_then(|v| u32::from_str_radix(v, 8).ok())
                .unwrap_or(0o775),
            space_limit: parse_u64("space_limit"),
            inode_limit: parse_u64("inode_limit"),
            space_guarantee: parse_u64("space_guarantee"),
            read_only: record.get("read_only").map(|v| v == "true").unwrap_or(false),
            layers: record
                .get("layers")
                .map(|v| {
                    v.split(';')
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            resolved_layers: Vec::new(),
            private: record.get("private").cloned().unwrap_or_default(),
            content: VolumeContent::default(),
            build_time_ms: parse_u64("build_time_ms"),
            change_time_ms: parse_u64("build_time_ms"),
            loop_index: record
                .get("loop_index")
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
            claimed_space: parse_u64("claimed_space"),
            nested: Vec::new(),
            links: Vec::new(),
            auto_path: record.get("auto_path").map(|v| v == "true").unwrap_or(false),
        };
        Ok((volume, links))
    }

    /// Wire-visible property map.
    pub fn describe(&self) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert("id".into(), self.id.clone());
        if let Some(built) = chrono::DateTime::from_timestamp_millis(self.build_time_ms as i64) {
            props.insert("build_time".into(), built.to_rfc3339());
        }
        props.insert("state".into(), self.state.to_string());
        props.insert("backend".into(), self.backend.to_string());
        if let Some(storage) = &self.storage {
            props.insert("storage".into(), storage.clone());
        }
        props.insert("place".into(), self.place.display().to_string());
        props.insert("owner_container".into(), self.owner_ct_name.clone());
        props.insert("space_limit".into(), self.space_limit.to_string());
        props.insert("inode_limit".into(), self.inode_limit.to_string());
        props.insert("read_only".into(), self.read_only.to_string());
        props.insert("layers".into(), self.layers.join(";"));
        props.insert("private".into(), self.private.clone());
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_spec_parse() {
        let spec = VolumeSpec::parse(&props(&[
            ("backend", "overlay"),
            ("layers", "base;app"),
            ("space_limit", "1G"),
            ("read_only", "false"),
            ("permissions", "0750"),
        ]))
        .unwrap();
        assert_eq!(spec.backend, Some(BackendKind::Overlay));
        assert_eq!(spec.layers, vec!["base".to_string(), "app".to_string()]);
        assert_eq!(spec.space_limit, 1 << 30);
        assert_eq!(spec.permissions, 0o750);
    }

    #[test]
    fn test_spec_default_backend() {
        let with_layers = VolumeSpec::parse(&props(&[("layers", "base")])).unwrap();
        assert_eq!(with_layers.backend_kind(), BackendKind::Overlay);
        let plain = VolumeSpec::parse(&props(&[])).unwrap();
        assert_eq!(plain.backend_kind(), BackendKind::Native);
    }

    #[test]
    fn test_spec_rejects_unknown_property() {
        let err = VolumeSpec::parse(&props(&[("frobnicate", "1")])).unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::InvalidProperty);
    }

    #[test]
    fn test_link_kv_roundtrip() {
        let link = VolumeLink {
            ct: CtId { index: 4, gen: 9 },
            ct_name: "a/b".into(),
            target: PathBuf::from("/data"),
            read_only: true,
            required: false,
            host_target: PathBuf::from("/chroot/a/data"),
        };
        let line = link.to_kv();
        let (name, target, ro, required, host) = VolumeLink::from_kv(&line).unwrap();
        assert_eq!(name, "a/b");
        assert_eq!(target, PathBuf::from("/data"));
        assert!(ro);
        assert!(!required);
        assert_eq!(host, PathBuf::from("/chroot/a/data"));
    }

    #[test]
    fn test_record_roundtrip() {
        let volume = Volume {
            id: "12".into(),
            state: VolState::Ready,
            backend: BackendKind::Overlay,
            path: PathBuf::from("/place/porto_volumes/12/volume"),
            internal_path: PathBuf::from("/place/porto_volumes/12/volume"),
            storage: None,
            place: PathBuf::from("/place"),
            owner_ct: CtId { index: 1, gen: 1 },
            owner_ct_name: "a".into(),
            owner_uid: 1000,
            owner_gid: 1000,
            cred_uid: 1000,
            cred_gid: 1000,
            permissions: 0o775,
            space_limit: 1 << 30,
            inode_limit: 0,
            space_guarantee: 0,
            read_only: false,
            layers: vec!["base".into()],
            resolved_layers: Vec::new(),
            private: "ci".into(),
            content: VolumeContent::default(),
            build_time_ms: 123,
            change_time_ms: 123,
            loop_index: -1,
            claimed_space: 1 << 30,
            nested: Vec::new(),
            links: vec![VolumeLink {
                ct: CtId { index: 1, gen: 1 },
                ct_name: "a".into(),
                target: PathBuf::new(),
                read_only: false,
                required: false,
                host_target: PathBuf::from("/place/porto_volumes/12/volume"),
            }],
            auto_path: true,
        };
        let record = volume.to_record();
        let (back, links) = Volume::from_record(&record).unwrap();
        assert_eq!(back.id, volume.id);
        assert_eq!(back.state, VolState::Ready);
        assert_eq!(back.backend, BackendKind::Overlay);
        assert_eq!(back.space_limit, volume.space_limit);
        assert_eq!(back.claimed_space, volume.claimed_space);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, "a");
        assert!(links[0].1.as_os_str().is_empty());
    }
}
