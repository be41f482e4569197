//! Container lifecycle operations.
//!
//! Stopped → Start → Starting → Running | Meta; Running|Meta → Pause →
//! Paused → Resume; task exit or fatal OOM → Dead; Dead → Respawn →
//! Starting; anything non-destroyed → Destroy. Every mutating operation
//! runs under the container's subtree write lock; the lock is
//! downgraded to a read hold across the fork/exec window so siblings
//! keep moving while the child boots.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_shared::{ArborError, ArborResult, ErrorKind};
use nix::sys::signal::Signal;

use super::capabilities::{self, ChainFeatures};
use super::property;
use super::task::TaskSpec;
use super::{Container, CtId, CtState, VirtMode};
use crate::cgroup::{self, Controllers};
use crate::daemon::Engine;
use crate::events::Event;
use crate::net::{NetMode, TcHandle};
use crate::stats::Statistics;
use crate::util::proc::kill_one;
use crate::volume::VolumeSpec;

/// Holder payload for isolated meta containers.
const META_HOLDER_COMMAND: &str = "/bin/sleep infinity";

/// Start a container (parents first, recursively).
pub fn start(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    let (state, parent) = engine.map.with(id, |ct| (ct.state, ct.parent))?;
    if state != CtState::Stopped {
        return Err(ArborError::invalid_state(format!(
            "cannot start from state {}",
            state
        )));
    }
    if let Some(parent) = parent {
        match engine.map.state_of(parent)? {
            CtState::Stopped => start(engine, parent)?,
            CtState::Paused => {
                return Err(ArborError::invalid_state("parent is paused"));
            }
            CtState::Running | CtState::Meta => {}
            other => {
                return Err(ArborError::invalid_state(format!(
                    "parent is {}",
                    other
                )))
            }
        }
    }

    let guard = engine.map.lock_write(id)?;
    engine.map.with_mut(id, |ct| ct.state = CtState::Starting)?;

    let fail = |e: ArborError| {
        cleanup_resources(engine, id);
        let _ = engine.map.with_mut(id, |ct| {
            ct.state = CtState::Stopped;
            ct.task_pid = 0;
            ct.wait_task_pid = 0;
        });
        Statistics::bump(&engine.stats.containers_failed_start);
        Err(e)
    };

    let skip_task = match start_prepare(engine, id) {
        Ok(skip) => skip,
        Err(e) => {
            drop(guard);
            return fail(e);
        }
    };

    if skip_task {
        engine.map.with_mut(id, |ct| {
            ct.state = CtState::Meta;
            ct.start_time_ms = crate::now_ms();
            ct.real_start_time_ms = crate::now_ms();
        })?;
        drop(guard);
    } else {
        let is_meta = engine.map.with(id, Container::is_meta)?;
        // The fork/exec window runs under a read hold so siblings stay
        // unblocked; the write lock comes back to publish the result.
        let read_guard = guard.downgrade();
        let spawned = build_task_spec(engine, id, is_meta).and_then(TaskSpec::spawn);
        let guard = read_guard.upgrade()?;
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                drop(guard);
                return fail(e);
            }
        };
        engine.map.with_mut(id, |ct| {
            ct.task_pid = spawned.task_pid;
            ct.wait_task_pid = spawned.wait_pid;
            ct.start_time_ms = crate::now_ms();
            ct.real_start_time_ms = crate::now_ms();
            ct.state = if is_meta { CtState::Meta } else { CtState::Running };
            ct.oom_killed = false;
            ct.exit_status = 0;
        })?;
        drop(guard);
        bump_running_children(engine, id, 1);
        tracing::info!(
            task = spawned.task_pid,
            wait_task = spawned.wait_pid,
            "container started"
        );
    }

    Statistics::bump(&engine.stats.containers_started);
    engine.map.save(id, &engine.kv_containers)?;
    engine.notify_state(id);
    Ok(())
}

/// Everything before the fork: hooks, capabilities, root volume,
/// cgroups. Returns whether the container runs without a task.
fn start_prepare(engine: &Arc<Engine>, id: CtId) -> ArborResult<bool> {
    // Property start hooks finalize defaults.
    engine.map.with_mut(id, |ct| -> ArborResult<()> {
        for desc in property::descriptors() {
            if let Some(hook) = desc.start {
                hook(ct)?;
            }
        }
        crate::util::path::require_normal_absolute(&ct.root_path)?;
        Ok(())
    })??;

    sanitize_capabilities(engine, id)?;

    // A root pointing at a disk image becomes a loop volume owned by
    // this container. The container holds it through a link of its
    // own, like any other volume user, so teardown follows the normal
    // unlink path; the declared root keeps naming the image.
    let root_image = engine
        .map
        .with(id, |ct| ct.root_path.clone())
        .ok()
        .filter(|root| root.is_file());
    if let Some(image) = root_image {
        let owner = engine.map.with(id, |ct| ct.owner_cred.clone())?;
        let spec = VolumeSpec {
            backend: Some(crate::storage::BackendKind::Loop),
            storage: Some(image.display().to_string()),
            ..Default::default()
        };
        let path = engine.volumes.create(spec, None, id, &owner)?;
        let vid = engine.volumes.resolve(&path)?;
        if let Err(e) = engine.volumes.link(vid, id, PathBuf::new(), false, false) {
            let _ = engine.volumes.destroy(vid);
            return Err(e);
        }
        engine.map.with_mut(id, |ct| {
            ct.root_volume = Some(vid);
            ct.root_volume_path = Some(path);
        })?;
    }

    let (is_meta, net, isolate, ip_count) = engine
        .map
        .with(id, |ct| {
            (ct.is_meta(), ct.net.clone(), ct.isolate, ct.ip_list.len())
        })?;
    // Addresses can only be configured on a namespace of our own.
    if ip_count > 0 && !net.is_isolated() {
        return Err(ArborError::invalid_value(
            "ip addresses require an isolated network",
        ));
    }

    prepare_resources(engine, id)?;

    Ok(is_meta && net == NetMode::Inherited && !isolate)
}

fn build_task_spec(engine: &Arc<Engine>, id: CtId, is_meta: bool) -> ArborResult<TaskSpec> {
    let cgroup_procs: Vec<PathBuf> = engine
        .map
        .with(id, |ct| {
            ct.controllers
                .names()
                .into_iter()
                .map(|name| engine.cgroups.cgroup(name, &ct.name).path.join("cgroup.procs"))
                .collect()
        })?;

    let stdout = open_tail(engine, id, true)?;
    let stderr = open_tail(engine, id, false)?;

    engine.map.with(id, |ct| {
        if is_meta {
            // The holder keeps the namespaces alive for the subtree.
            let mut holder = clone_for_spawn(ct);
            holder.command = META_HOLDER_COMMAND.to_string();
            TaskSpec::prepare(&holder, cgroup_procs.clone(), None, None)
        } else {
            TaskSpec::prepare(ct, cgroup_procs.clone(), stdout, stderr)
        }
    })?
}

/// Cheap field-level clone for spawn preparation.
fn clone_for_spawn(ct: &Container) -> Container {
    let mut copy = Container::new(ct.id, ct.name.clone(), ct.parent, ct.level);
    copy.command = ct.command.clone();
    copy.env = ct.env.clone();
    copy.cwd = ct.cwd.clone();
    copy.root_path = ct.root_path.clone();
    copy.root_volume_path = ct.root_volume_path.clone();
    copy.isolate = ct.isolate;
    copy.virt_mode = ct.virt_mode;
    copy.hostname = ct.hostname.clone();
    copy.bind_mounts = ct.bind_mounts.clone();
    copy.net = ct.net.clone();
    copy.ulimits = ct.ulimits.clone();
    copy.task_cred = ct.task_cred.clone();
    copy.cap_bound = ct.cap_bound.clone();
    copy.cap_ambient = ct.cap_ambient.clone();
    copy.oom_score_adj = ct.oom_score_adj;
    copy
}

fn open_tail(engine: &Arc<Engine>, id: CtId, stdout: bool) -> ArborResult<Option<File>> {
    let (path, cred) = engine.map.with(id, |ct| {
        (
            if stdout {
                ct.stdout_path.clone()
            } else {
                ct.stderr_path.clone()
            },
            ct.task_cred.clone(),
        )
    })?;
    let Some(path) = path else { return Ok(None) };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| ArborError::from(e).context(format!("opening {}", path.display())))?;
    let _ = nix::unistd::chown(
        &path,
        Some(nix::unistd::Uid::from_raw(cred.uid)),
        Some(nix::unistd::Gid::from_raw(cred.gid)),
    );
    Ok(Some(file))
}

/// §capability sanitization: clamp the declared sets against the host,
/// the chroot and the ancestor chain.
fn sanitize_capabilities(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    let mut features = ChainFeatures::default();
    let mut ancestor_limits = Vec::new();

    let chain: Vec<CtId> = {
        let mut chain = vec![id];
        chain.extend(engine.map.ancestors(id));
        chain
    };
    for node in &chain {
        engine.map.with(*node, |ct| {
            if ct.in_chroot() {
                features.chroot = true;
            }
            if ct.isolate {
                features.new_pid_ns = true;
            }
            if ct.memory_limit > 0 {
                features.mem_limit = true;
            }
            if ct.net.is_isolated() {
                features.new_net_ns = true;
            }
            if *node != id {
                if let Some(limit) = &ct.cap_limit {
                    ancestor_limits.push(limit.clone());
                }
            }
        })?;
    }

    let (owner_is_root, cap_limit, ambient) = engine.map.with(id, |ct| {
        (
            ct.owner_cred.is_root_user(),
            ct.cap_limit.clone(),
            ct.cap_ambient.clone(),
        )
    })?;
    let (bound, allowed) = capabilities::sanitize(
        &engine.host_caps,
        owner_is_root,
        cap_limit.as_ref(),
        &ancestor_limits,
        features,
    );
    capabilities::validate(&ambient, &allowed, &bound)?;
    engine.map.with_mut(id, |ct| {
        ct.cap_bound = bound;
        ct.cap_allowed = allowed;
    })?;
    Ok(())
}

/// Create cgroups, arm the OOM eventfd, set the netcls class.
fn prepare_resources(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    let (name, controllers, memory_limit, memory_guarantee, cpu_limit, cpu_guarantee, thread_limit, cwd) =
        engine.map.with(id, |ct| {
            (
                ct.name.clone(),
                ct.controllers,
                ct.memory_limit,
                ct.memory_guarantee,
                ct.cpu_limit_cores,
                ct.cpu_guarantee_cores,
                ct.thread_limit,
                ct.cwd.clone(),
            )
        })?;

    if !cwd.exists() {
        std::fs::create_dir_all(&cwd)
            .map_err(|e| ArborError::from(e).context("creating working directory"))?;
    }

    for controller in controllers.names() {
        let cg = engine.cgroups.create(controller, &name)?;
        match controller {
            "memory" => {
                let _ = cg.set_knob("memory.use_hierarchy", "1");
                if memory_limit > 0 {
                    cg.set_knob("memory.limit_in_bytes", &memory_limit.to_string())?;
                }
                if memory_guarantee > 0 {
                    let _ = cg.set_knob(
                        "memory.soft_limit_in_bytes",
                        &memory_guarantee.to_string(),
                    );
                }
                let efd = cgroup::register_oom_event(&cg)?;
                let raw = std::os::fd::AsRawFd::as_raw_fd(&efd);
                let efd = Arc::new(efd);
                engine.map.with_mut(id, |ct| ct.oom_event_fd = Some(efd))?;
                engine.oom_sources.lock().insert(raw, id);
                // The epoll loop picks the new fd up on its next pass.
                engine.wake_loop();
            }
            "cpu" => {
                if cpu_limit > 0.0 {
                    let period = 100_000u64;
                    let quota = (cpu_limit * period as f64) as u64;
                    let _ = cg.set_knob("cpu.cfs_period_us", &period.to_string());
                    cg.set_knob("cpu.cfs_quota_us", &quota.to_string())?;
                }
                if cpu_guarantee > 0.0 {
                    let shares = (cpu_guarantee * 1024.0) as u64;
                    let _ = cg.set_knob("cpu.shares", &shares.max(2).to_string());
                }
            }
            "net_cls" => {
                let handle = TcHandle::for_container(engine.map.with(id, |ct| ct.id)?);
                let _ = cg.set_knob("net_cls.classid", &handle.classid().to_string());
            }
            "pids" => {
                if thread_limit > 0 {
                    let _ = cg.set_knob("pids.max", &thread_limit.to_string());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Tear down cgroups, the OOM source and the root volume after stop or
/// failed start.
fn cleanup_resources(engine: &Arc<Engine>, id: CtId) {
    let Ok((name, controllers)) = engine
        .map
        .with(id, |ct| (ct.name.clone(), ct.controllers))
    else {
        return;
    };
    let root_volume = engine.map.with_mut(id, |ct| {
        ct.root_volume_path = None;
        ct.root_volume.take()
    });
    if let Ok(Some(vid)) = root_volume {
        if let Err(e) = engine.volumes.destroy(vid) {
            tracing::warn!(container = %name, error = %e, "root volume teardown failed");
        }
    }
    if let Ok(Some(raw)) = engine.map.with_mut(id, |ct| {
        ct.oom_event_fd
            .take()
            .map(|efd| std::os::fd::AsRawFd::as_raw_fd(&*efd))
    }) {
        engine.oom_sources.lock().remove(&raw);
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    for controller in controllers.names() {
        let cg = engine.cgroups.cgroup(controller, &name);
        if cg.exists() {
            let _ = cg.kill_all(Signal::SIGKILL, deadline);
            let _ = engine.cgroups.remove(&cg, deadline);
        }
    }
}

/// Stop the whole subtree; the deadline escalates SIGTERM to SIGKILL.
pub fn stop(engine: &Arc<Engine>, id: CtId, timeout_ms: Option<u64>) -> ArborResult<()> {
    let state = engine.map.state_of(id)?;
    if state == CtState::Stopped {
        return Ok(());
    }
    if !matches!(
        state,
        CtState::Running | CtState::Meta | CtState::Dead | CtState::Paused | CtState::Starting
    ) {
        return Err(ArborError::invalid_state(format!(
            "cannot stop from state {}",
            state
        )));
    }
    let deadline = Instant::now()
        + Duration::from_millis(timeout_ms.unwrap_or(engine.config.stop_timeout_ms));

    let guard = engine.map.lock_write(id)?;
    // Deepest first so children never outlive their parents' teardown.
    let mut order = engine.map.subtree(id);
    order.reverse();
    for node in &order {
        terminate(engine, *node, deadline)?;
    }
    for node in &order {
        let Ok(prev) = engine.map.with_mut(*node, |ct| {
            let prev = ct.state;
            ct.state = CtState::Stopped;
            ct.task_pid = 0;
            ct.wait_task_pid = 0;
            ct.seize_task_pid = 0;
            ct.death_time_ms = 0;
            ct.exit_status = 0;
            ct.oom_killed = false;
            prev
        }) else {
            continue;
        };
        cleanup_resources(engine, *node);
        if prev != CtState::Stopped {
            let _ = engine.map.save(*node, &engine.kv_containers);
            engine.notify_state(*node);
        }
        // Dead containers already dropped their running count in reap.
        if matches!(
            prev,
            CtState::Running | CtState::Meta | CtState::Starting | CtState::Paused
        ) {
            bump_running_children(engine, *node, -1);
        }
    }
    drop(guard);
    Ok(())
}

/// Terminate one container's task and drain its cgroups.
fn terminate(engine: &Arc<Engine>, id: CtId, deadline: Instant) -> ArborResult<()> {
    let (name, state, task_pid, virt_mode, has_freezer, isolate) =
        engine.map.with(id, |ct| {
            (
                ct.name.clone(),
                ct.state,
                ct.task_pid,
                ct.virt_mode,
                ct.controllers.contains(Controllers::FREEZER),
                ct.isolate,
            )
        })?;
    if !matches!(
        state,
        CtState::Running | CtState::Meta | CtState::Paused | CtState::Starting
    ) {
        return Ok(());
    }
    if !has_freezer && task_pid != 0 {
        return Err(ArborError::invalid_state(
            "cannot terminate a task without the freezer controller",
        ));
    }

    let freezer = engine.cgroups.cgroup("freezer", &name);
    if has_freezer && cgroup::is_frozen(&freezer) {
        // Frozen tasks cannot handle SIGTERM; kill and thaw.
        let _ = freezer.kill_all(Signal::SIGKILL, deadline);
        let _ = cgroup::thaw(&freezer, deadline);
    } else if task_pid != 0 {
        let graceful = if virt_mode == VirtMode::Os {
            Signal::SIGPWR
        } else {
            Signal::SIGTERM
        };
        let _ = kill_one(task_pid, graceful);
        while crate::util::proc::is_alive(task_pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        if crate::util::proc::is_alive(task_pid) {
            tracing::warn!(container = %name, task_pid, "graceful stop expired, killing");
            let _ = kill_one(task_pid, Signal::SIGKILL);
            if isolate {
                let wait_pid = engine.map.with(id, |ct| ct.wait_task_pid)?;
                if wait_pid != 0 {
                    let _ = kill_one(wait_pid, Signal::SIGKILL);
                }
            }
        }
    }
    if has_freezer && freezer.exists() {
        let _ = freezer.kill_all(Signal::SIGKILL, deadline);
        if cgroup::is_frozen(&freezer) {
            let _ = cgroup::thaw(&freezer, deadline);
        }
    }
    Ok(())
}

/// Freeze the subtree.
pub fn pause(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    let (name, state, has_freezer) = engine.map.with(id, |ct| {
        (
            ct.name.clone(),
            ct.state,
            ct.controllers.contains(Controllers::FREEZER),
        )
    })?;
    if !state.is_alive() {
        return Err(ArborError::invalid_state(format!(
            "cannot pause from state {}",
            state
        )));
    }
    if !has_freezer {
        return Err(ArborError::not_supported("pause needs the freezer controller"));
    }
    let guard = engine.map.lock_write(id)?;
    let freezer = engine.cgroups.cgroup("freezer", &name);
    cgroup::freeze(&freezer, Instant::now() + Duration::from_secs(10))?;
    for node in engine.map.subtree(id) {
        let _ = engine.map.with_mut(node, |ct| {
            if ct.state.is_alive() {
                ct.state = CtState::Paused;
            }
        });
        engine.notify_state(node);
    }
    drop(guard);
    Ok(())
}

/// Thaw the subtree.
pub fn resume(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    let (name, state) = engine.map.with(id, |ct| (ct.name.clone(), ct.state))?;
    if state != CtState::Paused {
        return Err(ArborError::invalid_state(format!(
            "cannot resume from state {}",
            state
        )));
    }
    let guard = engine.map.lock_write(id)?;
    let freezer = engine.cgroups.cgroup("freezer", &name);
    cgroup::thaw(&freezer, Instant::now() + Duration::from_secs(10))?;
    for node in engine.map.subtree(id) {
        let _ = engine.map.with_mut(node, |ct| {
            if ct.state == CtState::Paused {
                ct.state = if ct.is_meta() { CtState::Meta } else { CtState::Running };
            }
        });
        engine.notify_state(node);
    }
    drop(guard);
    Ok(())
}

/// Send a signal to the main task.
pub fn kill(engine: &Arc<Engine>, id: CtId, sig: i32) -> ArborResult<()> {
    let (state, task_pid) = engine.map.with(id, |ct| (ct.state, ct.task_pid))?;
    if state != CtState::Running {
        return Err(ArborError::invalid_state(format!(
            "cannot kill from state {}",
            state
        )));
    }
    if task_pid == 0 {
        return Err(ArborError::invalid_state("container has no task"));
    }
    let signal = Signal::try_from(sig)
        .map_err(|_| ArborError::invalid_value(format!("bad signal {}", sig)))?;
    kill_one(task_pid, signal)
}

/// Transition to Dead after the wait-task exited or a fatal OOM.
pub fn reap(engine: &Arc<Engine>, id: CtId, status: i32, oom_killed: bool) -> ArborResult<()> {
    let (name, state) = engine.map.with(id, |ct| (ct.name.clone(), ct.state))?;
    if !matches!(
        state,
        CtState::Running | CtState::Meta | CtState::Starting | CtState::Paused
    ) {
        // Already reaped or stopped: exit delivery is at-most-once.
        return Ok(());
    }
    let guard = engine.map.lock_write(id)?;

    // A lazily detected OOM kill is promoted retroactively; eventfd
    // notifications were already counted by the oom handler.
    let memory = engine.cgroups.cgroup("memory", &name);
    let oom_count = cgroup::oom_kill_count(&memory);
    let lazy_oom = !oom_killed && oom_count > 0;
    let oom_killed = oom_killed || oom_count > 0;

    engine.map.with_mut(id, |ct| {
        ct.exit_status = status;
        ct.oom_killed = oom_killed;
        if lazy_oom {
            ct.oom_events += 1;
        }
        ct.task_pid = 0;
        ct.wait_task_pid = 0;
        ct.seize_task_pid = 0;
        ct.death_time_ms = crate::now_ms();
        ct.state = CtState::Dead;
    })?;
    if oom_killed {
        Statistics::bump(&engine.stats.containers_oom);
    }
    drop(guard);
    bump_running_children(engine, id, -1);

    engine.map.save(id, &engine.kv_containers)?;
    engine.notify_state(id);

    let (may_respawn, delay) = engine
        .map
        .with(id, |ct| (ct.may_respawn(), ct.respawn_delay_ms))?;
    if may_respawn {
        engine.events.add(delay, Event::Respawn { ct: id });
    }
    tracing::info!(container = %name, status, oom_killed, "container dead");
    Ok(())
}

/// Respawn a dead container after its delay.
pub fn respawn(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    let (state, may) = engine.map.with(id, |ct| (ct.state, ct.may_respawn()))?;
    if state != CtState::Dead || !may {
        return Ok(());
    }
    engine.map.with_mut(id, |ct| {
        ct.respawn_count += 1;
        ct.state = CtState::Stopped;
        ct.death_time_ms = 0;
    })?;
    cleanup_resources(engine, id);
    Statistics::bump(&engine.stats.containers_respawned);
    start(engine, id)
}

/// Fatal-OOM handling scheduled by the epoll loop.
pub fn handle_oom(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    let (name, state, fatal) = engine
        .map
        .with(id, |ct| (ct.name.clone(), ct.state, ct.oom_is_fatal))?;
    engine.map.with_mut(id, |ct| ct.oom_events += 1)?;
    if !fatal || !state.is_alive() {
        return Ok(());
    }
    tracing::warn!(container = %name, "fatal OOM, tearing the container down");
    let freezer = engine.cgroups.cgroup("freezer", &name);
    let _ = freezer.kill_all(Signal::SIGKILL, Instant::now() + Duration::from_secs(10));
    reap(engine, id, 0, true)
}

/// Destroy a container and its subtree, bottom-up.
pub fn destroy(engine: &Arc<Engine>, id: CtId) -> ArborResult<()> {
    if id == engine.map.root || id == engine.map.porto_root {
        return Err(ArborError::permission("cannot destroy a root container"));
    }
    let state = engine.map.state_of(id)?;
    if state != CtState::Stopped && state != CtState::Dead {
        stop(engine, id, None)?;
    }

    let guard = engine.map.lock_write(id)?;
    let mut order = engine.map.subtree(id);
    order.reverse();
    let parent = engine.map.with(id, |ct| ct.parent)?;
    for node in order {
        // Give up volumes first: the root volume and links die with
        // the container, owned volumes still linked elsewhere move to
        // the parent.
        engine.volumes.unlink_all_for(node);
        cleanup_resources(engine, node);
        if let Some(parent) = parent {
            reassign_owned_volumes(engine, node, parent);
        }
        let bitmap_id = engine.map.with(node, |ct| ct.id)?;
        let _ = engine.kv_containers.remove(&bitmap_id.to_string());
        engine.map.with_mut(node, |ct| ct.state = CtState::Destroyed)?;
        engine.map.erase(node)?;
        Statistics::bump(&engine.stats.containers_destroyed);
    }
    drop(guard);
    Ok(())
}

fn reassign_owned_volumes(engine: &Arc<Engine>, from: CtId, to: CtId) {
    let Ok(owned) = engine.map.with(from, |ct| ct.owned_volumes.clone()) else {
        return;
    };
    let Ok(to_name) = engine.map.name_of(to) else { return };
    for vid in owned {
        let _ = engine.volumes.with_mut(vid, |volume| {
            volume.owner_ct = to;
            volume.owner_ct_name = to_name.clone();
        });
        let _ = engine.map.with_mut(to, |ct| ct.owned_volumes.push(vid));
    }
}

fn bump_running_children(engine: &Arc<Engine>, id: CtId, delta: i64) {
    for ancestor in engine.map.ancestors(id) {
        let _ = engine.map.with_mut(ancestor, |ct| {
            if delta > 0 {
                ct.running_children += delta as u32;
            } else {
                ct.running_children = ct.running_children.saturating_sub((-delta) as u32);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// properties

/// Read one property, including legacy cgroup passthrough names.
pub fn get_property(engine: &Arc<Engine>, id: CtId, name: &str) -> ArborResult<String> {
    if let Some(desc) = property::find(name) {
        return engine.map.with(id, |ct| (desc.get)(ct))?;
    }
    // Legacy "subsystem.knob" passthrough, read-only while running.
    if let Some((subsystem, _)) = name.split_once('.') {
        let controllers: Controllers = subsystem.parse().unwrap_or(Controllers::empty());
        if let Some(controller) = controllers.names().first().copied() {
            let (ct_name, state) = engine.map.with(id, |ct| (ct.name.clone(), ct.state))?;
            if !state.is_alive() {
                return Err(ArborError::invalid_state(format!(
                    "container is {}",
                    state
                )));
            }
            let cg = engine.cgroups.cgroup(controller, &ct_name);
            return cg.get_knob(name);
        }
    }
    Err(ArborError::invalid_property(format!(
        "unknown property {:?}",
        name
    )))
}

/// Set one property; dynamic properties apply to a live container and
/// roll back on failure.
pub fn set_property(engine: &Arc<Engine>, id: CtId, name: &str, value: &str) -> ArborResult<()> {
    let desc = property::find(name)
        .ok_or_else(|| ArborError::invalid_property(format!("unknown property {:?}", name)))?;
    let set = desc.set.ok_or_else(|| {
        ArborError::invalid_property(format!("property {} is read-only", name))
    })?;

    let guard = engine.map.lock_write(id)?;
    let state = engine.map.state_of(id)?;
    let live = matches!(
        state,
        CtState::Running | CtState::Meta | CtState::Starting | CtState::Paused
    );
    if live && !desc.dynamic {
        return Err(ArborError::invalid_state(format!(
            "property {} cannot change while {}",
            name, state
        )));
    }

    let previous = engine.map.with(id, |ct| (desc.get)(ct))??;
    engine.map.with_mut(id, |ct| {
        set(ct, value)?;
        ct.mark_prop_set(desc);
        Ok::<(), ArborError>(())
    })??;

    if live {
        if let Err(e) = apply_dynamic(engine, id, name) {
            // Restore the previous value; the revert itself is clean
            // because it passed validation before.
            let _ = engine.map.with_mut(id, |ct| set(ct, &previous));
            let _ = apply_dynamic(engine, id, name);
            return Err(e);
        }
    }
    drop(guard);
    engine.map.save(id, &engine.kv_containers)
}

/// Push a changed dynamic property into the running cgroups.
fn apply_dynamic(engine: &Arc<Engine>, id: CtId, name: &str) -> ArborResult<()> {
    let (ct_name, memory_limit, memory_guarantee, cpu_limit, cpu_guarantee, thread_limit, task_pid, oom_score_adj) =
        engine.map.with(id, |ct| {
            (
                ct.name.clone(),
                ct.memory_limit,
                ct.memory_guarantee,
                ct.cpu_limit_cores,
                ct.cpu_guarantee_cores,
                ct.thread_limit,
                ct.task_pid,
                ct.oom_score_adj,
            )
        })?;
    match name {
        "memory_limit" => {
            let cg = engine.cgroups.cgroup("memory", &ct_name);
            cg.set_knob("memory.limit_in_bytes", &memory_limit.to_string())
        }
        "memory_guarantee" => {
            let cg = engine.cgroups.cgroup("memory", &ct_name);
            cg.set_knob("memory.soft_limit_in_bytes", &memory_guarantee.to_string())
        }
        "cpu_limit" => {
            let cg = engine.cgroups.cgroup("cpu", &ct_name);
            let period = 100_000u64;
            let quota = if cpu_limit > 0.0 {
                ((cpu_limit * period as f64) as i64).to_string()
            } else {
                "-1".to_string()
            };
            cg.set_knob("cpu.cfs_quota_us", &quota)
        }
        "cpu_guarantee" => {
            let cg = engine.cgroups.cgroup("cpu", &ct_name);
            let shares = ((cpu_guarantee * 1024.0) as u64).max(2);
            cg.set_knob("cpu.shares", &shares.to_string())
        }
        "thread_limit" => {
            let cg = engine.cgroups.cgroup("pids", &ct_name);
            cg.set_knob("pids.max", &thread_limit.to_string())
        }
        "oom_score_adj" => {
            if task_pid != 0 {
                std::fs::write(
                    format!("/proc/{}/oom_score_adj", task_pid),
                    oom_score_adj.to_string(),
                )
                .map_err(|e| ArborError::from(e).context("setting oom_score_adj"))?;
            }
            Ok(())
        }
        // Other dynamic properties (labels, respawn policy, ...) have
        // no kernel state to poke.
        _ => Ok(()),
    }
}

/// Move an existing task into the container's cgroups.
pub fn attach(engine: &Arc<Engine>, id: CtId, pid: u32, comm: Option<&str>) -> ArborResult<()> {
    if let Some(expected) = comm {
        let actual = crate::util::proc::read_comm(pid)?;
        if actual != expected {
            return Err(ArborError::invalid_value(format!(
                "pid {} is {:?}, expected {:?}",
                pid, actual, expected
            )));
        }
    }
    let (name, state, controllers) = engine
        .map
        .with(id, |ct| (ct.name.clone(), ct.state, ct.controllers))?;
    if !state.is_alive() {
        return Err(ArborError::invalid_state(format!(
            "cannot attach to a {} container",
            state
        )));
    }
    for controller in controllers.names() {
        engine.cgroups.cgroup(controller, &name).attach(pid)?;
    }
    tracing::info!(container = %name, pid, "task attached");
    Ok(())
}
