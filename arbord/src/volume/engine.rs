//! The volume engine: maps, links, accounting, build and restore.
//!
//! One mutex guards the volume arena, the path map and the link index;
//! a condvar parks threads waiting for state transitions (Building →
//! Ready, Tuning → Ready, Destroying → Destroyed). Long operations run
//! with the volume parked in a transient state so the maps stay
//! consistent without holding the mutex across mounts.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_shared::{ArborError, ArborResult, ErrorKind};
use parking_lot::{Condvar, Mutex};

use super::content;
use super::layer::LayerStore;
use super::place;
use super::{VolId, VolState, Volume, VolumeLink, VolumeSpec};
use crate::container::{ContainerMap, Cred, CtId};
use crate::kv::KvStore;
use crate::now_ms;
use crate::storage::{backend_for, BackendKind};
use crate::util::fs as ufs;
use crate::util::path as upath;

/// Undo stack for multi-step construction: every side effect pushes its
/// inverse; on failure the stack unwinds in reverse order.
pub struct UndoStack {
    undos: Vec<Box<dyn FnOnce() + Send>>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self { undos: Vec::new() }
    }

    pub fn push(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.undos.push(Box::new(undo));
    }

    /// Keep every side effect; nothing unwinds.
    pub fn commit(mut self) {
        self.undos.clear();
    }
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UndoStack {
    fn drop(&mut self) {
        while let Some(undo) = self.undos.pop() {
            undo();
        }
    }
}

struct VolCell {
    gen: u32,
    volume: Volume,
}

#[derive(Default)]
struct EngineInner {
    arena: Vec<Option<VolCell>>,
    free_slots: Vec<u32>,
    next_gen: u32,
    by_path: BTreeMap<PathBuf, VolId>,
    links_by_host: HashMap<PathBuf, VolId>,
    next_seq: u64,
}

impl EngineInner {
    fn get(&self, id: VolId) -> ArborResult<&Volume> {
        match self.arena.get(id.index as usize) {
            Some(Some(cell)) if cell.gen == id.gen => Ok(&cell.volume),
            _ => Err(ArborError::no_volume(format!("#{}", id.index))),
        }
    }

    fn get_mut(&mut self, id: VolId) -> ArborResult<&mut Volume> {
        match self.arena.get_mut(id.index as usize) {
            Some(Some(cell)) if cell.gen == id.gen => Ok(&mut cell.volume),
            _ => Err(ArborError::no_volume(format!("#{}", id.index))),
        }
    }

    fn insert(&mut self, volume: Volume) -> VolId {
        let gen = self.next_gen;
        self.next_gen += 1;
        let path = volume.path.clone();
        let index = match self.free_slots.pop() {
            Some(slot) => {
                self.arena[slot as usize] = Some(VolCell { gen, volume });
                slot
            }
            None => {
                self.arena.push(Some(VolCell { gen, volume }));
                (self.arena.len() - 1) as u32
            }
        };
        let id = VolId { index, gen };
        self.by_path.insert(path, id);
        id
    }

    fn remove(&mut self, id: VolId) {
        let Ok(volume) = self.get(id) else { return };
        let path = volume.path.clone();
        let hosts: Vec<PathBuf> = volume
            .links
            .iter()
            .filter(|link| link.is_mounted())
            .map(|link| link.host_target.clone())
            .collect();
        for host in hosts {
            self.links_by_host.remove(&host);
        }
        self.by_path.remove(&path);
        self.arena[id.index as usize] = None;
        self.free_slots.push(id.index);
    }

    fn resolve(&self, path: &Path) -> ArborResult<VolId> {
        self.by_path
            .get(path)
            .copied()
            .ok_or_else(|| ArborError::no_volume(path.display()))
    }
}

/// Everything the engine needs to place one new volume.
pub struct VolumeEngine {
    inner: Mutex<EngineInner>,
    cond: Condvar,
    map: Arc<ContainerMap>,
    kv: KvStore,
    pub default_place: PathBuf,
}

impl VolumeEngine {
    pub fn new(
        map: Arc<ContainerMap>,
        kv: KvStore,
        default_place: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EngineInner::default()),
            cond: Condvar::new(),
            map,
            kv,
            default_place: default_place.into(),
        })
    }

    pub fn resolve(&self, path: &Path) -> ArborResult<VolId> {
        self.inner.lock().resolve(path)
    }

    pub fn with<R>(&self, id: VolId, f: impl FnOnce(&Volume) -> R) -> ArborResult<R> {
        let inner = self.inner.lock();
        inner.get(id).map(f)
    }

    pub fn with_mut<R>(&self, id: VolId, f: impl FnOnce(&mut Volume) -> R) -> ArborResult<R> {
        let mut inner = self.inner.lock();
        inner.get_mut(id).map(f)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Volume owning `host_target`, per the link index.
    pub fn volume_of_link(&self, host_target: &Path) -> Option<VolId> {
        self.inner.lock().links_by_host.get(host_target).copied()
    }

    fn save(&self, id: VolId) -> ArborResult<()> {
        let (record_id, record) = {
            let inner = self.inner.lock();
            let volume = inner.get(id)?;
            (volume.id.clone(), volume.to_record())
        };
        self.kv.save(&record_id, &record)
    }

    /// Park until a transient state settles; returns the final state.
    pub fn wait_stable(&self, id: VolId) -> ArborResult<VolState> {
        let mut inner = self.inner.lock();
        loop {
            let state = match inner.get(id) {
                Ok(volume) => volume.state,
                Err(_) => return Ok(VolState::Destroyed),
            };
            match state {
                VolState::Building | VolState::Tuning | VolState::Destroying => {
                    self.cond.wait(&mut inner);
                }
                stable => return Ok(stable),
            }
        }
    }

    fn set_state(&self, id: VolId, state: VolState) {
        let mut inner = self.inner.lock();
        if let Ok(volume) = inner.get_mut(id) {
            tracing::debug!(volume = %volume.id, from = %volume.state, to = %state, "volume state");
            volume.state = state;
            volume.change_time_ms = now_ms();
        }
        self.cond.notify_all();
    }

    // -----------------------------------------------------------------
    // creation

    /// Create and build a volume; returns its host path.
    pub fn create(
        &self,
        spec: VolumeSpec,
        path: Option<PathBuf>,
        owner_ct: CtId,
        owner_cred: &Cred,
    ) -> ArborResult<PathBuf> {
        let kind = spec.backend_kind();
        let place = spec
            .place
            .clone()
            .unwrap_or_else(|| self.default_place.clone());
        upath::require_normal_absolute(&place)?;
        let (owner_name, owner_places) = self
            .map
            .with(owner_ct, |ct| (ct.name.clone(), ct.place_list.clone()))?;
        place::check_place_allowed(&owner_places, &self.default_place, &place)?;
        place::prepare_place(&place)?;

        // Path and id selection plus the Building reservation happen
        // atomically under the engine lock.
        let (vid, volume_path) = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq + 1;
            let id_str = seq.to_string();
            let volume_dir = place.join(place::VOLUMES_DIR).join(&id_str);
            let (volume_path, auto_path) = match &path {
                Some(path) => {
                    let path = upath::normalize(path);
                    upath::require_normal_absolute(&path)?;
                    upath::check_not_system_path(&path)?;
                    (path, false)
                }
                None => (volume_dir.join("volume"), true),
            };
            if auto_path && kind == BackendKind::Quota {
                return Err(ArborError::invalid_value(
                    "quota volumes require an existing path",
                ));
            }
            self.check_conflicts(&inner, &volume_path, &spec)?;
            inner.next_seq = seq;

            // Backends that wrap an existing directory mount nothing;
            // their internal path is the path itself.
            let internal_path = match kind {
                BackendKind::Dir | BackendKind::Quota => volume_path.clone(),
                _ => volume_dir.join("volume"),
            };

            let volume = Volume {
                id: id_str,
                state: VolState::Building,
                backend: kind,
                path: volume_path.clone(),
                internal_path,
                storage: spec.storage.clone(),
                place: place.clone(),
                owner_ct,
                owner_ct_name: owner_name.clone(),
                owner_uid: owner_cred.uid,
                owner_gid: owner_cred.gid,
                cred_uid: spec.cred_uid.unwrap_or(owner_cred.uid),
                cred_gid: spec.cred_gid.unwrap_or(owner_cred.gid),
                permissions: spec.permissions,
                space_limit: spec.space_limit,
                inode_limit: spec.inode_limit,
                space_guarantee: spec.space_guarantee,
                read_only: spec.read_only,
                layers: spec.layers.clone(),
                resolved_layers: Vec::new(),
                private: spec.private.clone(),
                content: spec.content.clone(),
                build_time_ms: now_ms(),
                change_time_ms: now_ms(),
                loop_index: -1,
                claimed_space: 0,
                nested: Vec::new(),
                links: Vec::new(),
                auto_path,
            };
            let vid = inner.insert(volume);
            (vid, volume_path)
        };

        match self.build(vid, owner_ct) {
            Ok(()) => {
                self.set_state(vid, VolState::Ready);
                self.save(vid)?;
                self.map
                    .with_mut(owner_ct, |ct| ct.owned_volumes.push(vid))?;
                tracing::info!(path = %volume_path.display(), "volume built");
                Ok(volume_path)
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.remove(vid);
                drop(inner);
                self.cond.notify_all();
                Err(e)
            }
        }
    }

    /// Materialize a Building volume. All acquired resources unwind on
    /// failure through the undo stack.
    fn build(&self, vid: VolId, owner_ct: CtId) -> ArborResult<()> {
        let mut undo = UndoStack::new();
        let mut volume = self.with(vid, Volume::clone)?;
        let backend = backend_for(volume.backend);
        let map = Arc::clone(&self.map);

        // Per-volume directories under the place.
        let volume_dir = volume.volume_dir();
        std::fs::create_dir_all(&volume_dir)
            .map_err(|e| ArborError::from(e).context("creating volume dir"))?;
        {
            let dir = volume_dir.clone();
            undo.push(move || {
                let _ = std::fs::remove_dir_all(&dir);
            });
        }
        std::fs::create_dir_all(volume.temp_dir())
            .map_err(|e| ArborError::from(e).context("creating volume temp dir"))?;
        if volume.internal_path != volume.path {
            std::fs::create_dir_all(&volume.internal_path)
                .map_err(|e| ArborError::from(e).context("creating internal mountpoint"))?;
        }

        // Place quota charge for backends that consume the place.
        let claim = if backend.claim_place(&volume.backend_volume()).is_some() {
            volume.space_limit
        } else {
            0
        };
        if claim > 0 {
            place::charge(&map, owner_ct, &volume.place, claim)?;
            volume.claimed_space = claim;
            let (map2, place2) = (Arc::clone(&map), volume.place.clone());
            undo.push(move || place::release(&map2, owner_ct, &place2, claim));
        }

        // Layer resolution: named layers come from the place's store
        // (touching their mtime), absolute paths are used as given.
        // Each resolved layer gets a short slot under the volume dir so
        // the overlay option string stays bounded.
        let store = LayerStore::new(&volume.place);
        let mut resolved = Vec::new();
        for (i, layer) in volume.layers.iter().enumerate() {
            let real = if layer.starts_with('/') {
                let path = PathBuf::from(layer);
                upath::require_normal_absolute(&path)?;
                upath::check_not_system_path(&path)?;
                path
            } else {
                store.open(layer)?
            };
            if volume.backend == BackendKind::Squash && i == 0 {
                // layers[0] of a squash volume is the image itself.
                resolved.push(real);
                continue;
            }
            let slot = volume_dir.join(format!("L{}", i));
            let _ = std::fs::remove_file(&slot);
            std::os::unix::fs::symlink(&real, &slot)
                .map_err(|e| ArborError::from(e).context("creating layer slot"))?;
            resolved.push(slot);
        }
        volume.resolved_layers = resolved;

        // Register dependency edges on every volume our paths live in.
        self.register_nested(vid, &volume)?;

        backend.configure(&volume.backend_volume())?;

        // Cow shares go into a branch prepended to the overlay lowerdir.
        if volume.content.has_cow_shares() {
            let cow = volume.temp_dir().join("cow");
            std::fs::create_dir_all(&cow)
                .map_err(|e| ArborError::from(e).context("creating cow branch"))?;
            content::materialize(
                &cow,
                Some(&cow),
                &super::content::VolumeContent {
                    dirs: Vec::new(),
                    symlinks: Vec::new(),
                    shares: volume
                        .content
                        .shares
                        .iter()
                        .filter(|share| share.cow)
                        .cloned()
                        .collect(),
                },
                volume.cred_uid,
                volume.cred_gid,
            )?;
        }

        let mut view = volume.backend_volume();
        backend.build(&mut view)?;
        volume.loop_index = view.loop_index;
        {
            let built_view = view.clone();
            let kind = volume.backend;
            undo.push(move || {
                let mut view = built_view;
                let _ = backend_for(kind).destroy(&mut view);
            });
        }

        // Non-cow declared content lands in the mounted tree.
        let non_cow = super::content::VolumeContent {
            dirs: volume.content.dirs.clone(),
            symlinks: volume.content.symlinks.clone(),
            shares: volume
                .content
                .shares
                .iter()
                .filter(|share| !share.cow)
                .cloned()
                .collect(),
        };
        if !non_cow.is_empty() {
            content::materialize(
                &volume.internal_path,
                None,
                &non_cow,
                volume.cred_uid,
                volume.cred_gid,
            )?;
        }

        // The common link: the root container holds the volume at its
        // own path.
        if volume.internal_path != volume.path {
            std::fs::create_dir_all(&volume.path)
                .map_err(|e| ArborError::from(e).context("creating volume path"))?;
            self.mount_link(&volume.internal_path, &volume.path, volume.read_only)?;
            let path = volume.path.clone();
            undo.push(move || {
                let _ = ufs::umount_detach(&path);
            });
        }
        let common = VolumeLink {
            ct: map.root,
            ct_name: "/".to_string(),
            target: PathBuf::new(),
            read_only: volume.read_only,
            required: false,
            host_target: volume.path.clone(),
        };
        volume.links.push(common);

        // Publish the built state.
        {
            let mut inner = self.inner.lock();
            let host = volume.path.clone();
            let slot = inner.get_mut(vid)?;
            *slot = volume;
            inner.links_by_host.insert(host, vid);
        }
        undo.commit();
        Ok(())
    }

    /// Conflict check for a proposed host path.
    fn check_conflicts(
        &self,
        inner: &EngineInner,
        path: &Path,
        spec: &VolumeSpec,
    ) -> ArborResult<()> {
        for (existing_path, vid) in &inner.by_path {
            if existing_path == path {
                return Err(ArborError::volume_exists(path.display()));
            }
            if upath::is_strictly_inner(path, existing_path) {
                return Err(ArborError::busy(format!(
                    "volume {} lies inside the proposed path",
                    existing_path.display()
                )));
            }
            let existing = inner.get(*vid)?;
            if upath::is_strictly_inner(existing_path, path) && !existing.state.is_observable() {
                return Err(ArborError::volume_not_ready(existing_path.display()));
            }
            if let Some(storage) = &existing.storage {
                if storage.starts_with('/') && Path::new(storage) == path {
                    return Err(ArborError::busy(format!(
                        "path {} is the storage of volume {}",
                        path.display(),
                        existing_path.display()
                    )));
                }
            }
            for layer in &existing.layers {
                if layer.starts_with('/') && Path::new(layer) == path {
                    return Err(ArborError::busy(format!(
                        "path {} is a layer of volume {}",
                        path.display(),
                        existing_path.display()
                    )));
                }
            }
        }
        // The proposed storage must not clash with live volume paths.
        if let Some(storage) = spec.storage.as_ref().filter(|s| s.starts_with('/')) {
            let storage = Path::new(storage);
            upath::check_not_system_path(storage)?;
            if inner.by_path.contains_key(storage) {
                return Err(ArborError::busy(format!(
                    "storage {} is a volume path",
                    storage.display()
                )));
            }
        }
        Ok(())
    }

    /// Register this volume into `nested` of every volume whose path
    /// hosts our path, place, storage or absolute layers.
    fn register_nested(&self, vid: VolId, volume: &Volume) -> ArborResult<()> {
        let mut dependencies = vec![volume.path.clone(), volume.place.clone()];
        if let Some(storage) = volume.storage.as_ref().filter(|s| s.starts_with('/')) {
            dependencies.push(PathBuf::from(storage));
        }
        for layer in volume.layers.iter().filter(|l| l.starts_with('/')) {
            dependencies.push(PathBuf::from(layer));
        }

        let mut inner = self.inner.lock();
        let hosts: Vec<VolId> = inner
            .by_path
            .iter()
            .filter(|(host_path, host_id)| {
                **host_id != vid
                    && dependencies
                        .iter()
                        .any(|dep| upath::is_same_or_inner(host_path, dep))
            })
            .map(|(_, host_id)| *host_id)
            .collect();
        for host in hosts {
            let host_volume = inner.get_mut(host)?;
            if !host_volume.state.is_observable() && host_volume.state != VolState::Building {
                return Err(ArborError::volume_not_ready(host_volume.path.display()));
            }
            if !host_volume.nested.contains(&vid) {
                host_volume.nested.push(vid);
            }
        }
        Ok(())
    }

    /// Two-stage bind of `source` onto `target`: a private scratch bind
    /// first, then the final flags, then an atomic move onto the opened
    /// target directory.
    fn mount_link(&self, source: &Path, target: &Path, read_only: bool) -> ArborResult<()> {
        ufs::bind_mount(source, target, false)?;
        ufs::set_propagation(target, nix::mount::MsFlags::MS_PRIVATE)?;
        let mut flags = nix::mount::MsFlags::MS_NOSUID;
        if read_only {
            flags |= nix::mount::MsFlags::MS_RDONLY;
        }
        ufs::remount_bind(target, flags)?;
        ufs::set_propagation(
            target,
            nix::mount::MsFlags::MS_SLAVE,
        )?;
        ufs::set_propagation(target, nix::mount::MsFlags::MS_SHARED)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // links

    /// Link a volume into a container, optionally mounting a target.
    pub fn link(
        &self,
        vid: VolId,
        ct: CtId,
        target: PathBuf,
        read_only: bool,
        required: bool,
    ) -> ArborResult<()> {
        if !target.as_os_str().is_empty() {
            upath::require_normal_absolute(&target)?;
        }
        let (ct_name, ct_root) = self.map.with(ct, |c| (c.name.clone(), c.root_path.clone()))?;

        let (source, volume_ro) = {
            let mut inner = self.inner.lock();
            let volume = inner.get_mut(vid)?;
            if !volume.state.is_observable() {
                return Err(ArborError::volume_not_ready(volume.path.display()));
            }
            if volume
                .links
                .iter()
                .any(|l| l.ct == ct && l.target == target)
            {
                return Err(ArborError::new(
                    ErrorKind::VolumeAlreadyLinked,
                    format!("volume {} already linked", volume.path.display()),
                ));
            }
            (volume.internal_path.clone(), volume.read_only)
        };

        let host_target = if target.as_os_str().is_empty() {
            PathBuf::new()
        } else {
            let rel = target.strip_prefix("/").expect("checked absolute");
            let host_target = ct_root.join(rel);
            let base = ufs::open_dir(&ct_root)?;
            let (uid, gid) = self.map.with(ct, |c| (c.owner_cred.uid, c.owner_cred.gid))?;
            // Walk with O_NOFOLLOW, creating missing components chowned
            // to the link owner; a symlinked component aborts the walk.
            let dir_fd = ufs::walk_at(
                &base,
                rel,
                Some((
                    nix::unistd::Uid::from_raw(uid),
                    nix::unistd::Gid::from_raw(gid),
                    nix::sys::stat::Mode::from_bits_truncate(0o755),
                )),
            )?;
            // Bind onto the opened fd so the mount lands atomically on
            // the directory we inspected, then fix flags and rejoin the
            // shared propagation group.
            ufs::bind_mount(&source, &ufs::proc_fd_path(&dir_fd), false)?;
            ufs::set_propagation(&host_target, nix::mount::MsFlags::MS_PRIVATE)?;
            let mut flags = nix::mount::MsFlags::MS_NOSUID;
            if read_only || volume_ro {
                flags |= nix::mount::MsFlags::MS_RDONLY;
            }
            ufs::remount_bind(&host_target, flags)?;
            ufs::set_propagation(&host_target, nix::mount::MsFlags::MS_SLAVE)?;
            ufs::set_propagation(&host_target, nix::mount::MsFlags::MS_SHARED)?;
            host_target
        };

        {
            let mut inner = self.inner.lock();
            let volume = inner.get_mut(vid)?;
            volume.links.push(VolumeLink {
                ct,
                ct_name,
                target,
                read_only,
                required,
                host_target: host_target.clone(),
            });
            if !host_target.as_os_str().is_empty() {
                inner.links_by_host.insert(host_target.clone(), vid);
            }
        }
        if !host_target.as_os_str().is_empty() {
            self.bump_mounts(ct, 1);
        }
        if required {
            let volume_path = self.with(vid, |v| v.path.display().to_string())?;
            self.map
                .with_mut(ct, |c| c.required_volumes.push(volume_path))?;
        }
        self.save(vid)?;
        Ok(())
    }

    fn bump_mounts(&self, ct: CtId, delta: i64) {
        let mut chain = vec![ct];
        chain.extend(self.map.ancestors(ct));
        let mut inner = self.map.inner.lock();
        for id in chain {
            if let Ok(c) = inner.get_mut(id) {
                if delta > 0 {
                    c.volume_mounts += delta as u32;
                } else {
                    c.volume_mounts = c.volume_mounts.saturating_sub((-delta) as u32);
                }
            }
        }
    }

    /// Remove a container's link; destroys the volume when the last
    /// non-common link goes away unless `strict` forbids that.
    pub fn unlink(&self, vid: VolId, ct: CtId, strict: bool) -> ArborResult<()> {
        let root = self.map.root;
        let (removed, remaining_user_links) = {
            let mut inner = self.inner.lock();
            let volume = inner.get_mut(vid)?;
            let index = volume
                .links
                .iter()
                .position(|l| l.ct == ct)
                .ok_or_else(|| {
                    ArborError::new(
                        ErrorKind::VolumeNotLinked,
                        format!("volume {} is not linked", volume.path.display()),
                    )
                })?;
            let removed = volume.links.remove(index);
            let remaining = volume.links.iter().filter(|l| l.ct != root).count();
            let host = removed.host_target.clone();
            if removed.is_mounted() {
                inner.links_by_host.remove(&host);
            }
            (removed, remaining)
        };

        if removed.is_mounted() && removed.host_target != self.with(vid, |v| v.path.clone())? {
            let _ = ufs::umount_detach(&removed.host_target);
            self.bump_mounts(ct, -1);
        }
        if removed.required {
            let volume_path = self.with(vid, |v| v.path.display().to_string())?;
            let _ = self.map.with_mut(ct, |c| {
                c.required_volumes.retain(|p| *p != volume_path);
            });
        }

        if remaining_user_links == 0 {
            if strict {
                self.set_state(vid, VolState::Unlinked);
                self.save(vid)?;
            } else {
                self.destroy(vid)?;
                return Ok(());
            }
        } else {
            self.save(vid)?;
        }
        Ok(())
    }

    /// Drop every link a destroyed container holds; volumes whose only
    /// user was this container are destroyed.
    pub fn unlink_all_for(&self, ct: CtId) -> Vec<VolId> {
        let vids: Vec<VolId> = {
            let inner = self.inner.lock();
            inner
                .by_path
                .values()
                .filter(|vid| {
                    inner
                        .get(**vid)
                        .map(|v| v.links.iter().any(|l| l.ct == ct))
                        .unwrap_or(false)
                })
                .copied()
                .collect()
        };
        let mut destroyed = Vec::new();
        for vid in vids {
            if self.unlink(vid, ct, false).is_ok() && self.with(vid, |_| ()).is_err() {
                destroyed.push(vid);
            }
        }
        destroyed
    }

    // -----------------------------------------------------------------
    // tune / statfs / destroy

    /// Containers holding a required link on this volume.
    pub fn required_containers(&self, vid: VolId) -> Vec<CtId> {
        self.with(vid, |volume| {
            volume
                .links
                .iter()
                .filter(|l| l.required)
                .map(|l| l.ct)
                .collect()
        })
        .unwrap_or_default()
    }

    /// Resize limits through the backend; Ready → Tuning → Ready.
    pub fn tune(&self, vid: VolId, space: u64, inodes: u64) -> ArborResult<()> {
        {
            let mut inner = self.inner.lock();
            let volume = inner.get_mut(vid)?;
            if volume.state != VolState::Ready {
                return Err(ArborError::volume_not_ready(volume.path.display()));
            }
            volume.state = VolState::Tuning;
        }
        let result = self.tune_inner(vid, space, inodes);
        self.set_state(vid, VolState::Ready);
        if result.is_ok() {
            self.save(vid)?;
        }
        result
    }

    fn tune_inner(&self, vid: VolId, space: u64, inodes: u64) -> ArborResult<()> {
        let (mut view, kind, owner_ct, place_path, old_claim, claims_place) = {
            let inner = self.inner.lock();
            let volume = inner.get(vid)?;
            let backend = backend_for(volume.backend);
            (
                volume.backend_volume(),
                volume.backend,
                volume.owner_ct,
                volume.place.clone(),
                volume.claimed_space,
                backend.claim_place(&volume.backend_volume()).is_some(),
            )
        };

        // Charge the delta before growing; shrink releases afterwards.
        let new_claim = if claims_place { space } else { 0 };
        if new_claim > old_claim {
            place::charge(&self.map, owner_ct, &place_path, new_claim - old_claim)?;
        }
        let result = backend_for(kind).resize(&mut view, space, inodes);
        match &result {
            Ok(()) => {
                if new_claim < old_claim {
                    place::release(&self.map, owner_ct, &place_path, old_claim - new_claim);
                }
                let mut inner = self.inner.lock();
                let volume = inner.get_mut(vid)?;
                volume.space_limit = space;
                if inodes > 0 {
                    volume.inode_limit = inodes;
                }
                volume.claimed_space = new_claim;
            }
            Err(_) => {
                if new_claim > old_claim {
                    place::release(&self.map, owner_ct, &place_path, new_claim - old_claim);
                }
            }
        }
        result
    }

    pub fn statfs(&self, vid: VolId) -> ArborResult<crate::util::fs::FsStat> {
        let (view, kind) = {
            let inner = self.inner.lock();
            let volume = inner.get(vid)?;
            if !volume.state.is_observable() {
                return Err(ArborError::volume_not_ready(volume.path.display()));
            }
            (volume.backend_volume(), volume.backend)
        };
        backend_for(kind).statfs(&view)
    }

    /// Destroy a volume and, bottom-up, every volume nested in it.
    pub fn destroy(&self, vid: VolId) -> ArborResult<()> {
        // Collect the nested closure depth-first so leaves die first.
        let mut order = Vec::new();
        let mut stack = vec![vid];
        while let Some(next) = stack.pop() {
            if order.contains(&next) {
                continue;
            }
            order.push(next);
            if let Ok(nested) = self.with(next, |v| v.nested.clone()) {
                stack.extend(nested);
            }
        }
        for target in order.iter().rev() {
            self.destroy_one(*target)?;
        }
        Ok(())
    }

    fn destroy_one(&self, vid: VolId) -> ArborResult<()> {
        {
            let mut inner = self.inner.lock();
            let volume = match inner.get_mut(vid) {
                Ok(volume) => volume,
                Err(_) => return Ok(()),
            };
            if volume.state == VolState::Destroying || volume.state == VolState::Destroyed {
                return Ok(());
            }
            volume.state = VolState::Destroying;
        }

        let volume = self.with(vid, Volume::clone)?;
        // Drop user link mounts.
        for link in &volume.links {
            if link.is_mounted() && link.host_target != volume.path {
                let _ = ufs::umount_detach(&link.host_target);
                self.bump_mounts(link.ct, -1);
            }
        }
        if volume.internal_path != volume.path {
            let _ = ufs::umount_detach(&volume.path);
        }

        let mut view = volume.backend_volume();
        if let Err(e) = backend_for(volume.backend).destroy(&mut view) {
            tracing::warn!(volume = %volume.id, error = %e, "backend destroy failed");
        }
        if volume.claimed_space > 0 {
            place::release(&self.map, volume.owner_ct, &volume.place, volume.claimed_space);
        }
        let _ = self.map.with_mut(volume.owner_ct, |ct| {
            ct.owned_volumes.retain(|owned| *owned != vid);
        });
        let _ = std::fs::remove_dir_all(volume.volume_dir());
        let _ = self.kv.remove(&volume.id);

        let mut inner = self.inner.lock();
        inner.remove(vid);
        drop(inner);
        self.cond.notify_all();
        tracing::info!(volume = %volume.id, path = %volume.path.display(), "volume destroyed");
        Ok(())
    }

    // -----------------------------------------------------------------
    // listing / restore

    /// Volumes visible to `ct`, optionally filtered by path.
    pub fn list(&self, path: Option<&Path>, ct: Option<CtId>) -> Vec<VolId> {
        let inner = self.inner.lock();
        inner
            .by_path
            .iter()
            .filter(|(volume_path, vid)| {
                if let Some(filter) = path {
                    if filter != volume_path.as_path() {
                        return false;
                    }
                }
                if let Some(ct) = ct {
                    return inner
                        .get(**vid)
                        .map(|v| v.links.iter().any(|l| l.ct == ct))
                        .unwrap_or(false);
                }
                true
            })
            .map(|(_, vid)| *vid)
            .collect()
    }

    /// Reload volumes from the KV store after a restart.
    ///
    /// Links whose host target is no longer mounted are dropped;
    /// records that cannot be reopened are destroyed; place volume
    /// directories without a record are garbage collected.
    pub fn restore(&self) -> ArborResult<usize> {
        let mounts = ufs::mount_points().unwrap_or_default();
        let mut restored = 0;
        let mut seen_ids = Vec::new();

        for record_id in self.kv.list()? {
            let record = match self.kv.load(&record_id) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(record = %record_id, error = %e, "dropping unreadable volume");
                    let _ = self.kv.remove(&record_id);
                    continue;
                }
            };
            let (mut volume, links) = match Volume::from_record(&record) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(record = %record_id, error = %e, "dropping bad volume record");
                    let _ = self.kv.remove(&record_id);
                    continue;
                }
            };
            if volume.state != VolState::Ready && volume.state != VolState::Tuning {
                // Died mid-transition; tear down what is left.
                tracing::warn!(volume = %volume.id, state = %volume.state, "sweeping unfinished volume");
                let mut view = volume.backend_volume();
                let _ = backend_for(volume.backend).destroy(&mut view);
                let _ = std::fs::remove_dir_all(volume.volume_dir());
                let _ = self.kv.remove(&record_id);
                continue;
            }

            volume.owner_ct = self
                .map
                .resolve(&volume.owner_ct_name)
                .unwrap_or(self.map.root);
            let mut view = volume.backend_volume();
            if let Err(e) = backend_for(volume.backend).restore(&mut view) {
                tracing::warn!(volume = %volume.id, error = %e, "volume failed to reopen");
                let _ = backend_for(volume.backend).destroy(&mut view);
                let _ = std::fs::remove_dir_all(volume.volume_dir());
                let _ = self.kv.remove(&record_id);
                continue;
            }
            volume.loop_index = view.loop_index;
            volume.state = VolState::Ready;

            // Re-attach links still present in the mount table. Dir and
            // quota volumes carry no mount of their own, so their links
            // are trusted as-is.
            let mountless = matches!(volume.backend, BackendKind::Dir | BackendKind::Quota);
            for (ct_name, target, read_only, required, host_target) in links {
                let mounted = !host_target.as_os_str().is_empty() && !mountless;
                if mounted && !mounts.contains(&host_target) {
                    tracing::warn!(
                        volume = %volume.id,
                        host = %host_target.display(),
                        "dropping broken link"
                    );
                    continue;
                }
                let ct = self.map.resolve(&ct_name).unwrap_or(self.map.root);
                volume.links.push(VolumeLink {
                    ct,
                    ct_name,
                    target,
                    read_only,
                    required,
                    host_target,
                });
            }

            if volume.claimed_space > 0 {
                let _ = place::charge(
                    &self.map,
                    volume.owner_ct,
                    &volume.place.clone(),
                    volume.claimed_space,
                );
            }
            seen_ids.push(volume.id.clone());

            let owner_ct = volume.owner_ct;
            let mounted_links: Vec<CtId> = volume
                .links
                .iter()
                .filter(|l| l.is_mounted() && l.host_target != volume.path)
                .map(|l| l.ct)
                .collect();
            let hosts: Vec<PathBuf> = volume
                .links
                .iter()
                .filter(|link| link.is_mounted())
                .map(|link| link.host_target.clone())
                .collect();
            let vid = {
                let mut inner = self.inner.lock();
                let vid = inner.insert(volume);
                for host in hosts {
                    inner.links_by_host.insert(host, vid);
                }
                vid
            };
            for ct in mounted_links {
                self.bump_mounts(ct, 1);
            }
            let _ = self.map.with_mut(owner_ct, |ct| ct.owned_volumes.push(vid));
            self.save(vid)?;
            restored += 1;
        }

        let default_place = self.default_place.clone();
        self.gc_place(&default_place, &seen_ids);
        Ok(restored)
    }

    /// Remove place volume directories no loaded volume owns.
    fn gc_place(&self, place_root: &Path, live_ids: &[String]) {
        let volumes_dir = place_root.join(place::VOLUMES_DIR);
        let entries = match std::fs::read_dir(&volumes_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live_ids.contains(&name) {
                tracing::info!(dir = %entry.path().display(), "collecting orphan volume dir");
                let _ = ufs::umount_detach(&entry.path().join("volume"));
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }
}
