//! The engine: process-wide context and event handling.
//!
//! All daemon state hangs off one [`Engine`] passed through handlers;
//! tests instantiate fresh engines against temp directories. The epoll
//! loop, the supervisor and the worker pool live in the submodules.

pub mod epoll;
pub mod supervisor;
pub mod workers;

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use arbor_shared::ArborResult;
use parking_lot::Mutex;

use crate::cgroup::CgroupDriver;
use crate::config::DaemonConfig;
use crate::container::capabilities::HostCaps;
use crate::container::{lifecycle, ContainerMap, CtId, CtState};
use crate::events::{Event, EventQueue};
use crate::kv::KvStore;
use crate::stats::Statistics;
use crate::volume::engine::VolumeEngine;
use crate::volume::layer::LayerStore;
use crate::waiter::{WaiterFire, WaiterSet};

/// Process-wide engine context.
pub struct Engine {
    pub config: DaemonConfig,
    pub map: Arc<ContainerMap>,
    pub volumes: Arc<VolumeEngine>,
    pub events: Arc<EventQueue>,
    pub cgroups: CgroupDriver,
    pub kv_containers: KvStore,
    pub stats: Statistics,
    pub host_caps: HostCaps,
    pub waiters: WaiterSet,
    pub start_time_ms: u64,
    /// OOM eventfd raw fd → owning container, for the epoll loop.
    pub oom_sources: Mutex<HashMap<i32, CtId>>,
    /// Waiter deliveries awaiting the I/O thread.
    pub pending_fires: Mutex<Vec<WaiterFire>>,
    /// Ack pipe back to the supervisor; pids written here are released.
    pub ack_fd: Mutex<Option<OwnedFd>>,
    /// Weak containers per client fd; scheduled for destroy when the
    /// client disconnects.
    pub weak_by_client: Mutex<HashMap<i32, Vec<CtId>>>,
    /// Eventfd stirring the epoll loop; set by the loop at startup.
    pub wake: Mutex<Option<Arc<nix::sys::eventfd::EventFd>>>,
    /// Set by SIGINT: drop persistent state on the way out.
    pub discard_state: std::sync::atomic::AtomicBool,
}

impl Engine {
    pub fn new(config: DaemonConfig) -> ArborResult<Arc<Engine>> {
        let map = ContainerMap::new(config.max_containers);
        let kv_containers = KvStore::open(config.container_kv_dir())?;
        let kv_volumes = KvStore::open(config.volume_kv_dir())?;
        let volumes = VolumeEngine::new(Arc::clone(&map), kv_volumes, &config.default_place);
        let cgroups = CgroupDriver::new(&config.cgroup_root);

        Ok(Arc::new(Engine {
            map,
            volumes,
            events: EventQueue::new(),
            cgroups,
            kv_containers,
            stats: Statistics::default(),
            host_caps: HostCaps::probe(),
            waiters: WaiterSet::new(),
            start_time_ms: crate::now_ms(),
            oom_sources: Mutex::new(HashMap::new()),
            pending_fires: Mutex::new(Vec::new()),
            ack_fd: Mutex::new(None),
            weak_by_client: Mutex::new(HashMap::new()),
            wake: Mutex::new(None),
            discard_state: std::sync::atomic::AtomicBool::new(false),
            config,
        }))
    }

    /// Restore containers and volumes, then arm the maintenance events.
    pub fn restore(self: &Arc<Self>) -> ArborResult<()> {
        match self.map.restore(&self.kv_containers) {
            Ok(count) => tracing::info!(count, "containers restored"),
            Err(e) => {
                Statistics::bump(&self.stats.restore_errors);
                tracing::error!(error = %e, "container restore failed");
            }
        }
        match self.volumes.restore() {
            Ok(count) => tracing::info!(count, "volumes restored"),
            Err(e) => {
                Statistics::bump(&self.stats.restore_errors);
                tracing::error!(error = %e, "volume restore failed");
            }
        }
        // Dead containers resume their aging countdown.
        for id in self.map.subtree(self.map.root) {
            if self.map.state_of(id) == Ok(CtState::Dead) {
                let delay = self
                    .map
                    .with(id, |ct| {
                        ct.aging_time_ms
                            .saturating_sub(crate::now_ms().saturating_sub(ct.death_time_ms))
                    })
                    .unwrap_or(0);
                self.events.add(delay, Event::DestroyAgedContainer { ct: id });
            }
        }
        self.events
            .add(self.config.rotate_logs_interval_ms, Event::RotateLogs);
        self.events
            .add(self.config.network_watchdog_interval_ms, Event::NetworkWatchdog);
        Ok(())
    }

    /// Handle one due event from the queue worker.
    pub fn handle_event(self: &Arc<Self>, event: Event) {
        Statistics::bump(&self.stats.events_handled);
        tracing::debug!(kind = event.kind(), "handling event");
        match event {
            Event::Exit { pid, status } | Event::ChildExit { pid, status } => {
                self.deliver_exit(pid, status);
            }
            Event::Oom { ct } => {
                if let Err(e) = lifecycle::handle_oom(self, ct) {
                    tracing::warn!(error = %e, "oom handling failed");
                }
            }
            Event::Respawn { ct } => {
                if let Err(e) = lifecycle::respawn(self, ct) {
                    tracing::warn!(error = %e, "respawn failed");
                }
            }
            Event::RotateLogs => {
                self.rotate_logs();
                self.events
                    .add(self.config.rotate_logs_interval_ms, Event::RotateLogs);
            }
            Event::WaitTimeout { waiter } => {
                if let Some(fire) = self.waiters.timeout(waiter) {
                    self.queue_fire(fire);
                }
            }
            Event::DestroyAgedContainer { ct } => {
                let expired = self
                    .map
                    .with(ct, |c| {
                        c.state == CtState::Dead
                            && crate::now_ms().saturating_sub(c.death_time_ms) >= c.aging_time_ms
                    })
                    .unwrap_or(false);
                if expired {
                    tracing::info!("destroying aged container");
                    if let Err(e) = lifecycle::destroy(self, ct) {
                        tracing::warn!(error = %e, "aged destroy failed");
                    }
                }
            }
            Event::DestroyWeakContainer { ct } => {
                if let Err(e) = lifecycle::destroy(self, ct) {
                    tracing::warn!(error = %e, "weak destroy failed");
                }
            }
            Event::NetworkWatchdog => {
                self.events.add(
                    self.config.network_watchdog_interval_ms,
                    Event::NetworkWatchdog,
                );
            }
        }
    }

    /// Route one `(pid, status)` pair to the owning container.
    ///
    /// At-most-once: reaping clears the pid fields, so a replayed pid
    /// finds no owner and only re-acks.
    pub fn deliver_exit(self: &Arc<Self>, pid: u32, status: i32) {
        Statistics::bump(&self.stats.exit_events);
        let owner = self.find_by_wait_pid(pid);
        match owner {
            Some(ct) => {
                tracing::info!(pid, status, "task exited");
                if let Err(e) = lifecycle::reap(self, ct, status, false) {
                    tracing::warn!(pid, error = %e, "reap failed");
                }
            }
            None => tracing::debug!(pid, "exit for unknown pid"),
        }
        self.ack_pid(pid);
    }

    fn find_by_wait_pid(&self, pid: u32) -> Option<CtId> {
        let inner = self.map.inner.lock();
        for id in inner.subtree(self.map.root) {
            if let Ok(ct) = inner.get(id) {
                if pid != 0 && (ct.wait_task_pid == pid || ct.seize_task_pid == pid) {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Release a pid back to the supervisor.
    pub fn ack_pid(&self, pid: u32) {
        let guard = self.ack_fd.lock();
        if let Some(fd) = guard.as_ref() {
            let bytes = pid.to_ne_bytes();
            if let Err(e) = nix::unistd::write(fd, &bytes) {
                tracing::warn!(pid, error = %e, "ack write failed");
            }
        }
    }

    /// Report a container transition to waiters and schedule cleanup.
    pub fn notify_state(self: &Arc<Self>, ct: CtId) {
        let Ok((name, state, labels, weak, aging)) = self.map.with(ct, |c| {
            (
                c.name.clone(),
                c.state,
                c.labels.clone(),
                c.weak,
                c.aging_time_ms,
            )
        }) else {
            return;
        };
        for fire in self.waiters.notify(&name, state, &labels) {
            self.queue_fire(fire);
        }
        if state == CtState::Dead {
            self.events.add(aging, Event::DestroyAgedContainer { ct });
            if weak {
                self.events.add(0, Event::DestroyWeakContainer { ct });
            }
        }
    }

    fn queue_fire(&self, fire: WaiterFire) {
        self.pending_fires.lock().push(fire);
        self.wake_loop();
    }

    /// Stir the epoll loop so it notices completions and fires.
    pub fn wake_loop(&self) {
        let guard = self.wake.lock();
        if let Some(wake) = guard.as_ref() {
            let _ = wake.write(1);
        }
    }

    /// A client went away: drop its waiters and schedule its weak
    /// containers for destruction.
    pub fn client_disconnected(self: &Arc<Self>, fd: i32) {
        self.waiters.drop_client(fd);
        if let Some(weak) = self.weak_by_client.lock().remove(&fd) {
            for ct in weak {
                self.events.add(0, Event::DestroyWeakContainer { ct });
            }
        }
    }

    /// Truncate oversized stdout/stderr tails of live containers.
    fn rotate_logs(self: &Arc<Self>) {
        const MAX_TAIL: u64 = 8 << 20;
        for id in self.map.subtree(self.map.root) {
            let Ok(paths) = self.map.with(id, |ct| {
                (ct.stdout_path.clone(), ct.stderr_path.clone())
            }) else {
                continue;
            };
            for path in [paths.0, paths.1].into_iter().flatten() {
                if let Ok(meta) = std::fs::metadata(&path) {
                    if meta.len() > MAX_TAIL {
                        tracing::debug!(path = %path.display(), "rotating tail");
                        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(&path) {
                            let _ = file.set_len(0);
                        }
                    }
                }
            }
        }
    }

    /// Layer store of a place.
    pub fn layer_store(&self, place: Option<&std::path::Path>) -> LayerStore {
        LayerStore::new(place.unwrap_or(&self.config.default_place))
    }

    /// Spawn the background weak-layer sweeper.
    pub fn start_layer_sweeper(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("arbord-sweep".to_string())
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_millis(
                    engine.config.layer_sweep_interval_ms,
                ));
                let store = engine.layer_store(None);
                let max_idle =
                    std::time::Duration::from_millis(engine.config.layer_max_idle_ms);
                let removed = store.sweep(max_idle);
                if removed > 0 {
                    tracing::info!(removed, "layer sweep");
                }
            })
            .expect("spawning layer sweeper")
    }
}
