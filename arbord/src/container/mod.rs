//! The container tree.
//!
//! Containers live in a single arena indexed by their bitmap-allocated
//! id; each slot carries a generation so a stale handle never resolves
//! after the id is reused. One mutex guards the arena, the name map and
//! the embedded subtree-lock words; a condvar on the same mutex parks
//! threads waiting for subtree locks.

pub mod capabilities;
pub mod lifecycle;
pub mod lock;
pub mod property;
pub mod task;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arbor_shared::{ArborError, ArborResult};
use nix::sys::eventfd::EventFd;
use parking_lot::{Condvar, Mutex};

use crate::cgroup::{CgroupDriver, Controllers};
use crate::kv::{KvRecord, KvStore};
use crate::net::NetMode;
use crate::now_ms;
use crate::util::idmap::IdMap;
use crate::util::path::{base_name, parent_name, validate_name};
use crate::volume::VolId;
use capabilities::CapSet;

/// Maximum tree depth.
pub const MAX_LEVEL: usize = 7;

/// Default cap on live containers, overridable from config.
pub const DEFAULT_MAX_CONTAINERS: u32 = 4096;

/// Legacy default traffic-class minor; burned at startup so persisted id
/// layouts stay compatible.
pub const LEGACY_TC_MINOR_ID: u32 = 2;

/// Generational container handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtId {
    pub index: u32,
    pub gen: u32,
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtState {
    Stopped,
    Starting,
    Running,
    Meta,
    Paused,
    Dead,
    Destroyed,
}

impl CtState {
    pub fn as_str(self) -> &'static str {
        match self {
            CtState::Stopped => "stopped",
            CtState::Starting => "starting",
            CtState::Running => "running",
            CtState::Meta => "meta",
            CtState::Paused => "paused",
            CtState::Dead => "dead",
            CtState::Destroyed => "destroyed",
        }
    }

    /// Running or Meta: the payload (or its subtree) is live.
    pub fn is_alive(self) -> bool {
        matches!(self, CtState::Running | CtState::Meta)
    }

    pub fn is_stopped(self) -> bool {
        matches!(self, CtState::Stopped)
    }
}

impl std::str::FromStr for CtState {
    type Err = ArborError;

    fn from_str(s: &str) -> ArborResult<Self> {
        match s {
            "stopped" => Ok(CtState::Stopped),
            "starting" => Ok(CtState::Starting),
            "running" => Ok(CtState::Running),
            "meta" => Ok(CtState::Meta),
            "paused" => Ok(CtState::Paused),
            "dead" => Ok(CtState::Dead),
            "destroyed" => Ok(CtState::Destroyed),
            other => Err(ArborError::invalid_value(format!(
                "unknown container state {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client access level, monotone: a non-root user's effective level is
/// the minimum over the container chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessLevel {
    None,
    ReadOnly,
    ReadIsolate,
    Isolate,
    ChildOnly,
    Normal,
    SuperUser,
    Internal,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::ReadIsolate => "read-isolate",
            AccessLevel::Isolate => "isolate",
            AccessLevel::ChildOnly => "child-only",
            AccessLevel::Normal => "full",
            AccessLevel::SuperUser => "super",
            AccessLevel::Internal => "internal",
        }
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = ArborError;

    fn from_str(s: &str) -> ArborResult<Self> {
        match s {
            "none" | "false" => Ok(AccessLevel::None),
            "read-only" => Ok(AccessLevel::ReadOnly),
            "read-isolate" => Ok(AccessLevel::ReadIsolate),
            "isolate" => Ok(AccessLevel::Isolate),
            "child-only" => Ok(AccessLevel::ChildOnly),
            "full" | "true" => Ok(AccessLevel::Normal),
            "super" => Ok(AccessLevel::SuperUser),
            "internal" => Ok(AccessLevel::Internal),
            other => Err(ArborError::invalid_value(format!(
                "unknown access level {:?}",
                other
            ))),
        }
    }
}

/// Payload virtualization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtMode {
    /// Ordinary application payload.
    App,
    /// OS-style init payload; graceful stop sends SIGPWR.
    Os,
}

impl VirtMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VirtMode::App => "app",
            VirtMode::Os => "os",
        }
    }
}

/// Uid/gid pair with supplementary groups.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Cred {
    pub fn root() -> Self {
        Cred::default()
    }

    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn is_root_user(&self) -> bool {
        self.uid == 0
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }

    /// A credential controls another when it is root or shares the uid.
    pub fn can_control(&self, other: &Cred) -> bool {
        self.is_root_user() || self.uid == other.uid
    }
}

/// One bind mount requested by the `bind` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// One rlimit requested by the `ulimit` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

/// A container: declared configuration, runtime state and lock words.
#[derive(Debug)]
pub struct Container {
    // Identity.
    pub id: u32,
    pub name: String,
    pub parent: Option<CtId>,
    pub children: Vec<CtId>,
    pub level: usize,

    // Credentials.
    pub owner_cred: Cred,
    pub task_cred: Cred,

    // Declared configuration.
    pub command: String,
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub root_path: PathBuf,
    pub root_ro: bool,
    pub isolate: bool,
    pub virt_mode: VirtMode,
    pub hostname: Option<String>,
    pub resolv_conf: Option<String>,
    pub etc_hosts: Option<String>,
    pub bind_mounts: Vec<BindMount>,
    pub net: NetMode,
    pub ip_list: Vec<String>,
    pub default_gw: Vec<String>,
    pub ulimits: Vec<Ulimit>,
    pub devices: Vec<String>,
    pub controllers: Controllers,
    pub memory_limit: u64,
    pub memory_guarantee: u64,
    pub cpu_limit_cores: f64,
    pub cpu_guarantee_cores: f64,
    pub io_limit: u64,
    pub io_ops_limit: u64,
    pub net_limit: u64,
    pub net_guarantee: u64,
    pub thread_limit: u64,
    pub oom_is_fatal: bool,
    pub oom_score_adj: i32,
    pub respawn: bool,
    pub max_respawns: i64,
    pub respawn_delay_ms: u64,
    pub aging_time_ms: u64,
    pub porto_namespace: String,
    pub access_level: AccessLevel,
    pub private: String,
    pub weak: bool,
    pub place_list: Vec<PathBuf>,
    pub place_limit: BTreeMap<String, u64>,
    /// Claimed volume space per place bucket, kept by the volume engine.
    pub place_usage: BTreeMap<String, u64>,
    pub labels: BTreeMap<String, String>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,

    // Capabilities.
    pub cap_ambient: CapSet,
    pub cap_allowed: CapSet,
    pub cap_limit: Option<CapSet>,
    pub cap_bound: CapSet,

    // Runtime state.
    pub state: CtState,
    pub task_pid: u32,
    pub wait_task_pid: u32,
    pub seize_task_pid: u32,
    pub creation_time_ms: u64,
    pub start_time_ms: u64,
    pub real_start_time_ms: u64,
    pub death_time_ms: u64,
    pub exit_status: i32,
    pub oom_killed: bool,
    pub oom_events: u64,
    pub respawn_count: u64,
    /// Keeps the armed OOM eventfd alive; the epoll loop watches it.
    pub oom_event_fd: Option<Arc<EventFd>>,
    /// Loop volume built from a disk-image `root`, torn down on stop.
    pub root_volume: Option<VolId>,
    /// Mountpoint of that volume; the task chroots here while the
    /// declared `root` keeps pointing at the image.
    pub root_volume_path: Option<PathBuf>,

    // Derived state.
    pub owned_volumes: Vec<VolId>,
    pub volume_mounts: u32,
    pub required_volumes: Vec<String>,
    pub running_children: u32,

    // Subtree lock words (see `lock`).
    pub locked: i32,
    pub pending_writers: u32,
    pub subtree_read: u32,
    pub subtree_write: u32,

    /// Bitmask over property descriptor indices explicitly set by a
    /// client; unset properties re-inherit at start.
    pub props_set: u64,
}

impl Container {
    fn new(id: u32, name: String, parent: Option<CtId>, level: usize) -> Self {
        Self {
            id,
            name,
            parent,
            children: Vec::new(),
            level,
            owner_cred: Cred::root(),
            task_cred: Cred::root(),
            command: String::new(),
            env: Vec::new(),
            cwd: PathBuf::from("/"),
            root_path: PathBuf::from("/"),
            root_ro: false,
            isolate: true,
            virt_mode: VirtMode::App,
            hostname: None,
            resolv_conf: None,
            etc_hosts: None,
            bind_mounts: Vec::new(),
            net: NetMode::Inherited,
            ip_list: Vec::new(),
            default_gw: Vec::new(),
            ulimits: Vec::new(),
            devices: Vec::new(),
            controllers: Controllers::required(),
            memory_limit: 0,
            memory_guarantee: 0,
            cpu_limit_cores: 0.0,
            cpu_guarantee_cores: 0.0,
            io_limit: 0,
            io_ops_limit: 0,
            net_limit: 0,
            net_guarantee: 0,
            thread_limit: 0,
            oom_is_fatal: true,
            oom_score_adj: 0,
            respawn: false,
            max_respawns: -1,
            respawn_delay_ms: 1000,
            aging_time_ms: 24 * 60 * 60 * 1000,
            porto_namespace: String::new(),
            access_level: AccessLevel::Normal,
            private: String::new(),
            weak: false,
            place_list: Vec::new(),
            place_limit: BTreeMap::new(),
            place_usage: BTreeMap::new(),
            labels: BTreeMap::new(),
            stdout_path: None,
            stderr_path: None,
            cap_ambient: CapSet::empty(),
            cap_allowed: CapSet::empty(),
            cap_limit: None,
            cap_bound: CapSet::empty(),
            state: CtState::Stopped,
            task_pid: 0,
            wait_task_pid: 0,
            seize_task_pid: 0,
            creation_time_ms: now_ms(),
            start_time_ms: 0,
            real_start_time_ms: 0,
            death_time_ms: 0,
            exit_status: 0,
            oom_killed: false,
            oom_events: 0,
            respawn_count: 0,
            oom_event_fd: None,
            root_volume: None,
            root_volume_path: None,
            owned_volumes: Vec::new(),
            volume_mounts: 0,
            required_volumes: Vec::new(),
            running_children: 0,
            locked: 0,
            pending_writers: 0,
            subtree_read: 0,
            subtree_write: 0,
            props_set: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.name == "/"
    }

    pub fn is_porto_root(&self) -> bool {
        self.name == PORTO_ROOT_NAME
    }

    /// Meta containers hold a subtree instead of a task of their own.
    pub fn is_meta(&self) -> bool {
        self.command.is_empty()
    }

    /// Root the task actually enters: the root volume's mountpoint
    /// when the declared root is a disk image, the declared root
    /// otherwise.
    pub fn effective_root(&self) -> &std::path::Path {
        self.root_volume_path.as_deref().unwrap_or(&self.root_path)
    }

    pub fn in_chroot(&self) -> bool {
        self.effective_root() != std::path::Path::new("/")
    }

    pub fn may_respawn(&self) -> bool {
        self.respawn
            && (self.max_respawns < 0 || self.respawn_count < self.max_respawns as u64)
    }
}

/// Name of the distinguished first-level child the core creates.
pub const PORTO_ROOT_NAME: &str = "/porto";

struct Cell {
    gen: u32,
    ct: Container,
}

pub(crate) struct MapInner {
    arena: Vec<Option<Cell>>,
    next_gen: u32,
    by_name: BTreeMap<String, CtId>,
    ids: IdMap,
    pub max_containers: u32,
}

impl MapInner {
    pub(crate) fn get(&self, id: CtId) -> ArborResult<&Container> {
        match self.arena.get(id.index as usize) {
            Some(Some(cell)) if cell.gen == id.gen => Ok(&cell.ct),
            _ => Err(ArborError::no_container(format!("#{}", id.index))),
        }
    }

    pub(crate) fn get_mut(&mut self, id: CtId) -> ArborResult<&mut Container> {
        match self.arena.get_mut(id.index as usize) {
            Some(Some(cell)) if cell.gen == id.gen => Ok(&mut cell.ct),
            _ => Err(ArborError::no_container(format!("#{}", id.index))),
        }
    }

    pub(crate) fn resolve(&self, name: &str) -> ArborResult<CtId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ArborError::no_container(name))
    }

    /// Ancestor chain of `id`, nearest first, excluding `id` itself.
    pub(crate) fn ancestors(&self, id: CtId) -> Vec<CtId> {
        let mut chain = Vec::new();
        let mut current = self.get(id).ok().and_then(|ct| ct.parent);
        while let Some(parent) = current {
            chain.push(parent);
            current = self.get(parent).ok().and_then(|ct| ct.parent);
        }
        chain
    }

    /// Subtree of `id` in depth-first preorder, including `id`.
    pub(crate) fn subtree(&self, id: CtId) -> Vec<CtId> {
        let mut out = vec![id];
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Ok(ct) = self.get(next) {
                for child in &ct.children {
                    out.push(*child);
                    stack.push(*child);
                }
            }
        }
        out
    }

    fn insert(&mut self, ct: Container) -> CtId {
        let index = ct.id;
        let gen = self.next_gen;
        self.next_gen += 1;
        let name = ct.name.clone();
        let slot = index as usize;
        if self.arena.len() <= slot {
            self.arena.resize_with(slot + 1, || None);
        }
        debug_assert!(self.arena[slot].is_none());
        self.arena[slot] = Some(Cell { gen, ct });
        let id = CtId { index, gen };
        self.by_name.insert(name, id);
        id
    }
}

/// The process-wide container map and lock word.
pub struct ContainerMap {
    pub(crate) inner: Mutex<MapInner>,
    pub(crate) cond: Condvar,
    pub root: CtId,
    pub porto_root: CtId,
}

impl ContainerMap {
    /// Build a fresh tree holding `/` and `/porto`.
    pub fn new(max_containers: u32) -> Arc<Self> {
        let mut inner = MapInner {
            arena: Vec::new(),
            next_gen: 1,
            by_name: BTreeMap::new(),
            ids: IdMap::default(),
            max_containers,
        };

        inner.ids.claim(1).expect("fresh id map");
        let mut root = Container::new(1, "/".to_string(), None, 0);
        root.state = CtState::Meta;
        root.controllers = Controllers::all();
        let root_id = inner.insert(root);

        // Id 2 is the legacy default tc minor; burn it so persisted
        // layouts keep their numbering.
        inner.ids.claim(LEGACY_TC_MINOR_ID).expect("fresh id map");

        inner.ids.claim(3).expect("fresh id map");
        let mut porto = Container::new(3, PORTO_ROOT_NAME.to_string(), Some(root_id), 1);
        porto.state = CtState::Meta;
        porto.controllers = Controllers::porto_root_default();
        let porto_id = inner.insert(porto);

        if let Ok(root) = inner.get_mut(root_id) {
            root.children.push(porto_id);
        }

        Arc::new(Self {
            inner: Mutex::new(inner),
            cond: Condvar::new(),
            root: root_id,
            porto_root: porto_id,
        })
    }

    /// Run `f` with shared access to a container.
    pub fn with<R>(&self, id: CtId, f: impl FnOnce(&Container) -> R) -> ArborResult<R> {
        let inner = self.inner.lock();
        inner.get(id).map(f)
    }

    /// Run `f` with exclusive access to a container's fields.
    ///
    /// This serializes only the field access; long operations must hold
    /// the subtree lock as well.
    pub fn with_mut<R>(&self, id: CtId, f: impl FnOnce(&mut Container) -> R) -> ArborResult<R> {
        let mut inner = self.inner.lock();
        inner.get_mut(id).map(f)
    }

    pub fn resolve(&self, name: &str) -> ArborResult<CtId> {
        self.inner.lock().resolve(name)
    }

    pub fn name_of(&self, id: CtId) -> ArborResult<String> {
        self.with(id, |ct| ct.name.clone())
    }

    pub fn state_of(&self, id: CtId) -> ArborResult<CtState> {
        self.with(id, |ct| ct.state)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All names, sorted, for List.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().by_name.keys().cloned().collect()
    }

    /// Ancestor chain (nearest first) of a container.
    pub fn ancestors(&self, id: CtId) -> Vec<CtId> {
        self.inner.lock().ancestors(id)
    }

    /// Depth-first subtree including the node itself.
    pub fn subtree(&self, id: CtId) -> Vec<CtId> {
        self.inner.lock().subtree(id)
    }

    /// Create a new container under an existing parent.
    ///
    /// The parent chain contributes inherited defaults: place list,
    /// access-level floor, controllers union, porto namespace prefix.
    pub fn create(&self, name: &str, owner: &Cred) -> ArborResult<CtId> {
        validate_name(name)?;
        if name == "/" || name == PORTO_ROOT_NAME {
            return Err(ArborError::container_exists(name));
        }

        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(name) {
            return Err(ArborError::container_exists(name));
        }
        if inner.by_name.len() >= inner.max_containers as usize {
            return Err(ArborError::resource(format!(
                "container limit {} reached",
                inner.max_containers
            )));
        }

        let parent_id = match parent_name(name) {
            Some(parent) => inner.resolve(parent).map_err(|_| {
                ArborError::no_container(format!("parent of {}", name))
            })?,
            None => self.root,
        };

        let parent = inner.get(parent_id)?;
        if parent.level + 1 > MAX_LEVEL {
            return Err(ArborError::invalid_value(format!(
                "container {} would exceed depth {}",
                name, MAX_LEVEL
            )));
        }

        // Inherited defaults.
        let level = parent.level + 1;
        let place_list = parent.place_list.clone();
        let access_floor = parent.access_level;
        let controllers = parent.controllers | Controllers::required();
        let aging_time_ms = parent.aging_time_ms;

        let id = inner.ids.alloc()?;
        let mut ct = Container::new(id, name.to_string(), Some(parent_id), level);
        ct.owner_cred = owner.clone();
        ct.task_cred = owner.clone();
        ct.place_list = place_list;
        ct.access_level = access_floor.min(AccessLevel::Normal);
        ct.controllers = controllers;
        ct.aging_time_ms = aging_time_ms;

        let ctid = inner.insert(ct);
        inner.get_mut(parent_id)?.children.push(ctid);
        drop(inner);

        tracing::info!(name, id, "container created");
        Ok(ctid)
    }

    /// Unregister a destroyed container and free its id.
    ///
    /// The caller must have completed `Destroy` for the whole subtree;
    /// this only drops the bookkeeping.
    pub(crate) fn erase(&self, id: CtId) -> ArborResult<()> {
        let mut inner = self.inner.lock();
        let (name, bitmap_id, parent) = {
            let ct = inner.get(id)?;
            (ct.name.clone(), ct.id, ct.parent)
        };
        if let Some(parent) = parent {
            if let Ok(parent_ct) = inner.get_mut(parent) {
                parent_ct.children.retain(|child| *child != id);
            }
        }
        inner.by_name.remove(&name);
        inner.arena[id.index as usize] = None;
        inner.ids.free(bitmap_id);
        self.cond.notify_all();
        tracing::info!(name, id = bitmap_id, "container erased");
        Ok(())
    }

    /// Map a pid to its owning container through the freezer cgroup.
    pub fn find_task_container(&self, pid: u32) -> CtId {
        let path = match CgroupDriver::freezer_path_of_pid(pid) {
            Ok(path) => path,
            Err(_) => return self.root,
        };
        match CgroupDriver::container_of_cgroup(&path) {
            Some(name) => self.resolve(&name).unwrap_or(self.root),
            None => self.root,
        }
    }

    /// Effective access level of a client credential sitting in `base`:
    /// the minimum of the declared levels along the chain; root uid is
    /// never demoted below its own container's level.
    pub fn effective_access_level(&self, base: CtId) -> AccessLevel {
        let inner = self.inner.lock();
        let mut level = match inner.get(base) {
            Ok(ct) => ct.access_level,
            Err(_) => return AccessLevel::None,
        };
        for ancestor in inner.ancestors(base) {
            if let Ok(ct) = inner.get(ancestor) {
                level = level.min(ct.access_level);
            }
        }
        level
    }

    /// Serialize the persisted fields of a container.
    pub fn to_record(&self, id: CtId) -> ArborResult<KvRecord> {
        self.with(id, property::serialize)?
    }

    /// Persist one container.
    pub fn save(&self, id: CtId, kv: &KvStore) -> ArborResult<()> {
        let (bitmap_id, record) = {
            let inner = self.inner.lock();
            let ct = inner.get(id)?;
            (ct.id, property::serialize(ct)?)
        };
        kv.save(&bitmap_id.to_string(), &record)
    }

    /// Recreate containers from the KV store on startup.
    ///
    /// Records are loaded shallowest-first so parents exist before
    /// children; tasks of restored containers are gone after a cold
    /// start, so live states collapse to Dead.
    pub fn restore(self: &Arc<Self>, kv: &KvStore) -> ArborResult<usize> {
        let mut records: Vec<(u32, KvRecord)> = Vec::new();
        for record_id in kv.list()? {
            let bitmap_id: u32 = match record_id.parse() {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!(record = %record_id, "dropping malformed container record");
                    let _ = kv.remove(&record_id);
                    continue;
                }
            };
            match kv.load(&record_id) {
                Ok(record) => records.push((bitmap_id, record)),
                Err(e) => {
                    tracing::warn!(record = %record_id, error = %e, "dropping unreadable record");
                    let _ = kv.remove(&record_id);
                }
            }
        }
        records.sort_by_key(|(_, record)| {
            record
                .get("name")
                .map(|name| crate::util::path::name_level(name))
                .unwrap_or(usize::MAX)
        });

        let mut restored = 0;
        for (bitmap_id, record) in records {
            let name = match record.get("name") {
                Some(name) => name.clone(),
                None => {
                    let _ = kv.remove(&bitmap_id.to_string());
                    continue;
                }
            };
            match self.restore_one(bitmap_id, &name, &record) {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::warn!(name, error = %e, "container restore failed");
                    let _ = kv.remove(&bitmap_id.to_string());
                }
            }
        }
        Ok(restored)
    }

    fn restore_one(&self, bitmap_id: u32, name: &str, record: &KvRecord) -> ArborResult<()> {
        validate_name(name)?;
        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(name) {
            return Err(ArborError::container_exists(name));
        }
        let parent_id = match parent_name(name) {
            Some(parent) => inner.resolve(parent)?,
            None => self.root,
        };
        inner.ids.claim(bitmap_id)?;
        let level = inner.get(parent_id)?.level + 1;
        let mut ct = Container::new(bitmap_id, name.to_string(), Some(parent_id), level);
        if let Err(e) = property::deserialize(&mut ct, record) {
            inner.ids.free(bitmap_id);
            return Err(e);
        }
        if ct.state.is_alive() || ct.state == CtState::Starting || ct.state == CtState::Paused {
            // The payload did not survive the restart.
            ct.state = CtState::Dead;
            ct.death_time_ms = now_ms();
            ct.task_pid = 0;
            ct.wait_task_pid = 0;
        }
        let ctid = inner.insert(ct);
        inner.get_mut(parent_id)?.children.push(ctid);
        tracing::info!(name = base_name(name), id = bitmap_id, "container restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> Arc<ContainerMap> {
        ContainerMap::new(DEFAULT_MAX_CONTAINERS)
    }

    #[test]
    fn test_new_tree_has_both_roots() {
        let map = map();
        assert!(map.exists("/"));
        assert!(map.exists(PORTO_ROOT_NAME));
        assert_eq!(map.len(), 2);
        assert_eq!(map.with(map.root, |ct| ct.id).unwrap(), 1);
        // Id 2 stays burned for the legacy tc minor.
        assert_eq!(map.with(map.porto_root, |ct| ct.id).unwrap(), 3);
    }

    #[test]
    fn test_create_links_parent_and_child() {
        let map = map();
        let a = map.create("a", &Cred::new(1000, 1000)).unwrap();
        let ab = map.create("a/b", &Cred::new(1000, 1000)).unwrap();

        let children = map.with(a, |ct| ct.children.clone()).unwrap();
        assert_eq!(children, vec![ab]);
        assert_eq!(map.with(ab, |ct| ct.parent).unwrap(), Some(a));
        assert_eq!(map.with(ab, |ct| ct.level).unwrap(), 2);
    }

    #[test]
    fn test_create_requires_parent() {
        let map = map();
        let err = map.create("a/b", &Cred::root()).unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::ContainerDoesNotExist);
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let map = map();
        map.create("a", &Cred::root()).unwrap();
        let err = map.create("a", &Cred::root()).unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::ContainerAlreadyExists);
    }

    #[test]
    fn test_erase_frees_name_and_id_for_reuse() {
        let map = map();
        let a = map.create("a", &Cred::root()).unwrap();
        let first_id = map.with(a, |ct| ct.id).unwrap();
        map.erase(a).unwrap();

        assert!(!map.exists("a"));
        assert!(map.with(a, |_| ()).is_err(), "stale handle must not resolve");
        // Create/erase pairs walk the rotating cursor over the whole id
        // space; the freed id must come back around exactly once.
        let mut seen = false;
        for i in 0..=crate::util::idmap::DEFAULT_CAPACITY {
            let id = map.create(&format!("r{}", i), &Cred::root()).unwrap();
            let reused = map.with(id, |ct| ct.id).unwrap() == first_id;
            map.erase(id).unwrap();
            if reused {
                seen = true;
                break;
            }
        }
        assert!(seen);
    }

    #[test]
    fn test_max_containers_enforced() {
        let map = ContainerMap::new(4);
        map.create("a", &Cred::root()).unwrap();
        map.create("b", &Cred::root()).unwrap();
        let err = map.create("c", &Cred::root()).unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::ResourceNotAvailable);
    }

    #[test]
    fn test_depth_cap() {
        let map = map();
        let mut name = String::new();
        for i in 0..MAX_LEVEL {
            if i > 0 {
                name.push('/');
            }
            name.push('x');
            map.create(&name, &Cred::root()).unwrap();
        }
        let too_deep = format!("{}/x", name);
        assert!(map.create(&too_deep, &Cred::root()).is_err());
    }

    #[test]
    fn test_controllers_inherited_superset() {
        let map = map();
        map.create("a", &Cred::root()).unwrap();
        let a = map.resolve("a").unwrap();
        map.with_mut(a, |ct| ct.controllers |= Controllers::PIDS)
            .unwrap();
        let ab = map.create("a/b", &Cred::root()).unwrap();
        let child_controllers = map.with(ab, |ct| ct.controllers).unwrap();
        assert!(child_controllers.contains(Controllers::PIDS));
    }

    #[test]
    fn test_effective_access_level_is_min() {
        let map = map();
        let a = map.create("a", &Cred::root()).unwrap();
        let ab = map.create("a/b", &Cred::root()).unwrap();
        map.with_mut(a, |ct| ct.access_level = AccessLevel::ReadOnly)
            .unwrap();
        assert_eq!(map.effective_access_level(ab), AccessLevel::ReadOnly);
        assert_eq!(map.effective_access_level(map.root), AccessLevel::Normal);
    }

    #[test]
    fn test_subtree_order() {
        let map = map();
        let a = map.create("a", &Cred::root()).unwrap();
        map.create("a/b", &Cred::root()).unwrap();
        map.create("a/b/c", &Cred::root()).unwrap();
        map.create("a/d", &Cred::root()).unwrap();
        let subtree = map.subtree(a);
        assert_eq!(subtree.len(), 4);
        assert_eq!(subtree[0], a);
    }
}
