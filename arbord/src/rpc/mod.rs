//! RPC dispatcher.
//!
//! One request maps to one handler; handlers return errors upward and
//! the dispatcher serializes `(kind, message)` into the response. The
//! only request without an immediate final answer is a synchronous
//! Wait, which is acknowledged with the `Queued` marker and completed
//! later by a waiter fire.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arbor_shared::{rpc, ArborError, ArborResult, ErrorKind};
use prost::Message;

use crate::client::ClientInfo;
use crate::container::{lifecycle, AccessLevel, CtId, CtState};
use crate::daemon::Engine;
use crate::events::Event;
use crate::stats::Statistics;
use crate::volume::VolumeSpec;
use crate::waiter::wildcard_match;

/// Decode, dispatch and serialize one framed request.
pub fn handle_frame(engine: &Arc<Engine>, info: &ClientInfo, frame: &[u8]) -> rpc::Response {
    let started = Instant::now();
    let request = match rpc::Request::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            let err = ArborError::invalid_data(format!("undecodable request: {}", e));
            engine.stats.note_request(started.elapsed(), false);
            return rpc::Response::error(&err);
        }
    };
    let Some(body) = request.body else {
        let err = ArborError::invalid_method("unknown or missing request method");
        engine.stats.note_request(started.elapsed(), false);
        return rpc::Response::error(&err);
    };

    let result = dispatch(engine, info, body);
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(client = info.fd, error = %e, "request failed");
            rpc::Response::error(&e)
        }
    };
    engine.stats.note_request(
        started.elapsed(),
        ErrorKind::from_code(response.error) == ErrorKind::Success
            || ErrorKind::from_code(response.error) == ErrorKind::Queued,
    );
    response
}

fn dispatch(
    engine: &Arc<Engine>,
    info: &ClientInfo,
    body: rpc::request::Body,
) -> ArborResult<rpc::Response> {
    use rpc::request::Body;
    match body {
        Body::Create(req) => create(engine, info, &req.name, req.weak),
        Body::Destroy(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            lifecycle::destroy(engine, ct)?;
            Ok(rpc::Response::ok())
        }
        Body::Start(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            check_task_cred(engine, info, ct)?;
            lifecycle::start(engine, ct)?;
            Ok(rpc::Response::ok())
        }
        Body::Stop(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            lifecycle::stop(engine, ct, req.timeout_ms)?;
            Ok(rpc::Response::ok())
        }
        Body::Pause(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            lifecycle::pause(engine, ct)?;
            Ok(rpc::Response::ok())
        }
        Body::Resume(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            lifecycle::resume(engine, ct)?;
            Ok(rpc::Response::ok())
        }
        Body::Kill(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            lifecycle::kill(engine, ct, req.signal)?;
            Ok(rpc::Response::ok())
        }
        Body::Respawn(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            if engine.map.state_of(ct)? != CtState::Stopped {
                lifecycle::stop(engine, ct, None)?;
            }
            lifecycle::start(engine, ct)?;
            Ok(rpc::Response::ok())
        }
        Body::List(req) => list(engine, info, req.mask.as_deref()),
        Body::GetProperty(req) => {
            info.can_read()?;
            let ct = resolve(engine, info, &req.name)?;
            let value = lifecycle::get_property(engine, ct, &req.property)?;
            Ok(rpc::Response::with_body(rpc::response::Body::Property(
                rpc::PropertyResponse { value },
            )))
        }
        Body::SetProperty(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            lifecycle::set_property(engine, ct, &req.property, &req.value)?;
            Ok(rpc::Response::ok())
        }
        Body::Attach(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            lifecycle::attach(engine, ct, req.pid, req.comm.as_deref())?;
            Ok(rpc::Response::ok())
        }
        Body::Wait(req) => wait(engine, info, req),
        Body::StopAsyncWait(req) => {
            let names: Vec<String> = req
                .names
                .iter()
                .map(|name| info.resolve_name(name))
                .collect();
            engine.waiters.stop_async(info.fd, &names);
            Ok(rpc::Response::ok())
        }
        Body::FindTaskContainer(req) => {
            info.can_read()?;
            let ct = engine.map.find_task_container(req.pid);
            let internal = engine.map.name_of(ct)?;
            let name = info.compose_name(&internal).unwrap_or(internal);
            Ok(rpc::Response::with_body(rpc::response::Body::Property(
                rpc::PropertyResponse { value: name },
            )))
        }
        Body::SetLabel(req) => {
            let ct = resolve(engine, info, &req.name)?;
            info.can_control(engine, ct)?;
            set_label(engine, ct, &req.label, &req.value)?;
            Ok(rpc::Response::ok())
        }
        Body::CreateVolume(req) => create_volume(engine, info, req),
        Body::TuneVolume(req) => tune_volume(engine, info, req),
        Body::LinkVolume(req) => {
            let ct = resolve(engine, info, &req.container)?;
            info.can_control(engine, ct)?;
            let vid = resolve_volume(engine, info, &req.path)?;
            let target = if req.target.is_empty() {
                PathBuf::new()
            } else {
                PathBuf::from(&req.target)
            };
            engine
                .volumes
                .link(vid, ct, target, req.read_only, req.required)?;
            Ok(rpc::Response::ok())
        }
        Body::UnlinkVolume(req) => {
            let ct = resolve(engine, info, &req.container)?;
            info.can_control(engine, ct)?;
            let vid = resolve_volume(engine, info, &req.path)?;
            // Required links pin running containers; stop them first.
            if !req.strict {
                for holder in engine.volumes.required_containers(vid) {
                    if engine.map.state_of(holder).map(CtState::is_alive).unwrap_or(false) {
                        lifecycle::stop(engine, holder, None)?;
                    }
                }
            }
            engine.volumes.unlink(vid, ct, req.strict)?;
            Ok(rpc::Response::ok())
        }
        Body::ListVolumes(req) => list_volumes(engine, info, req),
        Body::ImportLayer(req) => {
            require_level(info, AccessLevel::Normal)?;
            let store = engine.layer_store(req.place.as_deref().map(Path::new));
            let tarball = client_path(engine, info, Path::new(&req.tarball))?;
            let deadline = Instant::now()
                + std::time::Duration::from_millis(engine.config.helper_timeout_ms);
            store.import(&req.layer, &tarball, req.merge, deadline)?;
            Statistics::bump(&engine.stats.layers_imported);
            Ok(rpc::Response::ok())
        }
        Body::RemoveLayer(req) => {
            require_level(info, AccessLevel::Normal)?;
            let store = engine.layer_store(req.place.as_deref().map(Path::new));
            store.remove(&req.layer)?;
            Ok(rpc::Response::ok())
        }
        Body::ListLayers(req) => {
            info.can_read()?;
            let store = engine.layer_store(req.place.as_deref().map(Path::new));
            let mut layers = store.list()?;
            if let Some(mask) = &req.mask {
                layers.retain(|layer| wildcard_match(mask, layer));
            }
            Ok(rpc::Response::with_body(rpc::response::Body::LayerList(
                rpc::ListLayersResponse { layers },
            )))
        }
        Body::GetSystem(_) => {
            info.can_read()?;
            Ok(rpc::Response::with_body(rpc::response::Body::System(
                rpc::SystemResponse {
                    version: crate::VERSION.to_string(),
                    start_time_ms: engine.start_time_ms,
                    stats: engine.stats.snapshot(),
                },
            )))
        }
    }
}

fn resolve(engine: &Arc<Engine>, info: &ClientInfo, name: &str) -> ArborResult<CtId> {
    let internal = info.resolve_name(name);
    if internal != crate::container::PORTO_ROOT_NAME {
        crate::util::path::validate_name(&internal)?;
    }
    engine
        .map
        .resolve(&internal)
        .map_err(|_| ArborError::no_container(name))
}

fn require_level(info: &ClientInfo, level: AccessLevel) -> ArborResult<()> {
    if info.access_level >= level {
        Ok(())
    } else {
        Err(ArborError::permission(format!(
            "operation needs {} access, client has {}",
            level.as_str(),
            info.access_level.as_str()
        )))
    }
}

/// Host path of a client-visible path: chrooted clients speak relative
/// to their own root.
fn client_path(engine: &Arc<Engine>, info: &ClientInfo, path: &Path) -> ArborResult<PathBuf> {
    crate::util::path::require_normal_absolute(path)?;
    let root = engine.map.with(info.ct, |ct| ct.root_path.clone())?;
    if root == Path::new("/") {
        Ok(path.to_path_buf())
    } else {
        Ok(root.join(path.strip_prefix("/").expect("checked absolute")))
    }
}

fn create(
    engine: &Arc<Engine>,
    info: &ClientInfo,
    name: &str,
    weak: bool,
) -> ArborResult<rpc::Response> {
    let internal = info.resolve_name(name);
    if info.access_level < AccessLevel::ChildOnly {
        return Err(ArborError::permission("client may not create containers"));
    }
    if info.access_level == AccessLevel::ChildOnly {
        let prefix = format!("{}/", info.client_ct_name);
        if !internal.starts_with(&prefix) {
            return Err(ArborError::permission(
                "child-only client may create only its own children",
            ));
        }
    }
    // Creating a child is a mutation of the parent: the client must
    // control the parent's owner, exactly like any other write.
    let parent_id = match crate::util::path::parent_name(&internal) {
        Some(parent) => engine
            .map
            .resolve(parent)
            .map_err(|_| ArborError::no_container(format!("parent of {}", name)))?,
        None => engine.map.root,
    };
    if parent_id != engine.map.root {
        info.can_control(engine, parent_id)?;
    }
    let ct = engine.map.create(&internal, &info.cred)?;
    Statistics::bump(&engine.stats.containers_created);
    if weak {
        engine.map.with_mut(ct, |c| c.weak = true)?;
        engine
            .weak_by_client
            .lock()
            .entry(info.fd)
            .or_default()
            .push(ct);
    }
    engine.map.save(ct, &engine.kv_containers)?;
    Ok(rpc::Response::ok())
}

/// Starting a payload as someone else needs ownership of that uid:
/// inside a chroot anything goes, otherwise only root, the same uid, or
/// an ancestor with super access.
fn check_task_cred(engine: &Arc<Engine>, info: &ClientInfo, ct: CtId) -> ArborResult<()> {
    let (task_cred, owner_cred, in_chroot, is_root_path) = engine.map.with(ct, |c| {
        (
            c.task_cred.clone(),
            c.owner_cred.clone(),
            c.in_chroot(),
            c.root_path == Path::new("/"),
        )
    })?;
    if is_root_path && task_cred.is_root_user() && !owner_cred.is_root_user() {
        return Err(ArborError::permission(
            "running root tasks on the host root requires a root owner",
        ));
    }
    if in_chroot || info.access_level >= AccessLevel::SuperUser {
        return Ok(());
    }
    if info.cred.can_control(&task_cred) {
        Ok(())
    } else {
        Err(ArborError::permission(format!(
            "client uid {} may not run tasks as uid {}",
            info.cred.uid, task_cred.uid
        )))
    }
}

fn list(engine: &Arc<Engine>, info: &ClientInfo, mask: Option<&str>) -> ArborResult<rpc::Response> {
    info.can_read()?;
    let mut names = Vec::new();
    for internal in engine.map.names() {
        if internal == "/" {
            continue;
        }
        let Some(visible) = info.compose_name(&internal) else {
            continue;
        };
        if let Some(mask) = mask {
            if !wildcard_match(mask, &visible) {
                continue;
            }
        }
        names.push(visible);
    }
    Ok(rpc::Response::with_body(rpc::response::Body::List(
        rpc::ListResponse { names },
    )))
}

fn set_label(engine: &Arc<Engine>, ct: CtId, label: &str, value: &str) -> ArborResult<()> {
    if label.is_empty() || label.len() > 128 || !label.contains('.') {
        return Err(ArborError::invalid_value(
            "labels look like PREFIX.name with a dot",
        ));
    }
    engine.map.with_mut(ct, |c| {
        if value.is_empty() {
            c.labels.remove(label);
        } else {
            c.labels.insert(label.to_string(), value.to_string());
        }
    })?;
    engine.map.save(ct, &engine.kv_containers)
}

fn wait(engine: &Arc<Engine>, info: &ClientInfo, req: rpc::WaitRequest) -> ArborResult<rpc::Response> {
    info.can_read()?;
    let names: Vec<String> = req
        .names
        .iter()
        .map(|name| info.resolve_name(name))
        .collect();
    let wildcards: Vec<String> = req
        .wildcards
        .iter()
        .map(|w| info.resolve_name(w))
        .collect();
    let label = match &req.label {
        Some(raw) => {
            let (key, pattern) = raw
                .split_once('=')
                .ok_or_else(|| ArborError::invalid_value("label filter looks like name=glob"))?;
            Some((key.to_string(), pattern.to_string()))
        }
        None => None,
    };

    let waiter = engine.waiters.register(
        info.fd,
        names.clone(),
        wildcards,
        req.target_states.clone(),
        label,
        req.asynchronous,
    );
    if let Some(timeout_ms) = req.timeout_ms {
        engine.events.add(timeout_ms, Event::WaitTimeout { waiter });
    }

    // A watched container already in a matching state fires at once.
    for name in &names {
        if let Ok(ct) = engine.map.resolve(name) {
            engine.notify_state(ct);
        }
    }

    if req.asynchronous {
        Ok(rpc::Response::ok())
    } else {
        Ok(rpc::Response {
            error: ErrorKind::Queued.code(),
            error_message: String::new(),
            body: None,
        })
    }
}

fn describe_volume(
    engine: &Arc<Engine>,
    info: &ClientInfo,
    vid: crate::volume::VolId,
) -> ArborResult<rpc::VolumeDescription> {
    let mut description = engine.volumes.with(vid, |volume| rpc::VolumeDescription {
        path: volume.path.display().to_string(),
        properties: volume.describe(),
        containers: volume
            .links
            .iter()
            .filter_map(|link| info.compose_name(&link.ct_name))
            .collect(),
    })?;
    if let Ok(st) = engine.volumes.statfs(vid) {
        description
            .properties
            .insert("space_used".into(), st.space_used.to_string());
        description
            .properties
            .insert("space_available".into(), st.space_avail.to_string());
        description
            .properties
            .insert("inode_used".into(), st.inode_used.to_string());
        description
            .properties
            .insert("inode_available".into(), st.inode_avail.to_string());
    }
    Ok(description)
}

fn resolve_volume(
    engine: &Arc<Engine>,
    info: &ClientInfo,
    path: &str,
) -> ArborResult<crate::volume::VolId> {
    let host = client_path(engine, info, Path::new(path))?;
    engine.volumes.resolve(&host)
}

fn create_volume(
    engine: &Arc<Engine>,
    info: &ClientInfo,
    req: rpc::CreateVolumeRequest,
) -> ArborResult<rpc::Response> {
    require_level(info, AccessLevel::Normal)?;
    let spec = VolumeSpec::parse(&req.properties)?;
    let owner_ct = match &spec.owner_container {
        Some(name) => {
            let ct = resolve(engine, info, name)?;
            info.can_control(engine, ct)?;
            ct
        }
        None => info.ct,
    };
    let path = if req.path.is_empty() {
        None
    } else {
        Some(client_path(engine, info, Path::new(&req.path))?)
    };
    match engine.volumes.create(spec, path, owner_ct, &info.cred) {
        Ok(path) => {
            Statistics::bump(&engine.stats.volumes_created);
            let vid = engine.volumes.resolve(&path)?;
            let description = describe_volume(engine, info, vid)?;
            Ok(rpc::Response::with_body(rpc::response::Body::Volume(
                description,
            )))
        }
        Err(e) => {
            Statistics::bump(&engine.stats.volumes_failed);
            Err(e)
        }
    }
}

fn tune_volume(
    engine: &Arc<Engine>,
    info: &ClientInfo,
    req: rpc::TuneVolumeRequest,
) -> ArborResult<rpc::Response> {
    let vid = resolve_volume(engine, info, &req.path)?;
    let owner = engine.volumes.with(vid, |v| v.owner_ct)?;
    info.can_control(engine, owner)?;

    let mut space = None;
    let mut inodes = None;
    for (key, value) in &req.properties {
        match key.as_str() {
            "space_limit" => space = Some(crate::container::property::parse_size(value)?),
            "inode_limit" => inodes = Some(crate::container::property::parse_size(value)?),
            "private" => {
                engine.volumes.with_mut(vid, |v| v.private = value.clone())?;
            }
            other => {
                return Err(ArborError::invalid_property(format!(
                    "volume property {:?} cannot be tuned",
                    other
                )))
            }
        }
    }
    if space.is_some() || inodes.is_some() {
        let current = engine.volumes.with(vid, |v| (v.space_limit, v.inode_limit))?;
        engine
            .volumes
            .tune(vid, space.unwrap_or(current.0), inodes.unwrap_or(current.1))?;
    }
    Ok(rpc::Response::ok())
}

fn list_volumes(
    engine: &Arc<Engine>,
    info: &ClientInfo,
    req: rpc::ListVolumesRequest,
) -> ArborResult<rpc::Response> {
    info.can_read()?;
    let path_filter = match &req.path {
        Some(path) => Some(client_path(engine, info, Path::new(path))?),
        None => None,
    };
    let ct_filter = match &req.container {
        Some(name) => Some(resolve(engine, info, name)?),
        None => None,
    };
    let mut volumes = Vec::new();
    for vid in engine.volumes.list(path_filter.as_deref(), ct_filter) {
        if let Ok(description) = describe_volume(engine, info, vid) {
            volumes.push(description);
        }
    }
    Ok(rpc::Response::with_body(rpc::response::Body::VolumeList(
        rpc::ListVolumesResponse { volumes },
    )))
}
