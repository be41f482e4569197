//! Volume engine flows with the mountless `dir` backend.

mod common;

use std::collections::HashMap;
use std::path::PathBuf;

use arbord::container::lifecycle;
use arbord::storage::BackendKind;
use arbord::volume::{VolState, VolumeSpec};
use arbord::ErrorKind;
use common::{current_cred, test_engine};

fn dir_spec() -> VolumeSpec {
    let mut properties = HashMap::new();
    properties.insert("backend".to_string(), "dir".to_string());
    VolumeSpec::parse(&properties).unwrap()
}

#[test]
fn dir_volume_builds_and_registers() {
    let (dir, engine) = test_engine();
    let target = dir.path().join("data/vol");
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();

    let path = engine
        .volumes
        .create(
            dir_spec(),
            Some(target.clone()),
            engine.map.root,
            &current_cred(),
        )
        .unwrap();
    assert_eq!(path, target);
    assert!(target.is_dir());

    let vid = engine.volumes.resolve(&target).unwrap();
    assert_eq!(engine.volumes.with(vid, |v| v.state).unwrap(), VolState::Ready);
    assert_eq!(
        engine.volumes.with(vid, |v| v.backend).unwrap(),
        BackendKind::Dir
    );
    // The common link is owned by the root container at the volume path.
    let links = engine.volumes.with(vid, |v| v.links.clone()).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].ct, engine.map.root);
    assert_eq!(links[0].host_target, target);

    // Place layout came up around it.
    assert!(engine.config.default_place.join("porto_volumes").is_dir());
    assert!(engine.config.default_place.join("porto_layers").is_dir());
}

#[test]
fn conflicting_paths_are_rejected() {
    let (dir, engine) = test_engine();
    let target = dir.path().join("data/vol");
    std::fs::create_dir_all(&target).unwrap();
    engine
        .volumes
        .create(dir_spec(), Some(target.clone()), engine.map.root, &current_cred())
        .unwrap();

    let err = engine
        .volumes
        .create(dir_spec(), Some(target.clone()), engine.map.root, &current_cred())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::VolumeAlreadyExists);

    // A path holding an existing volume strictly inside is busy.
    let err = engine
        .volumes
        .create(
            dir_spec(),
            Some(dir.path().join("data")),
            engine.map.root,
            &current_cred(),
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Busy);

    let err = engine
        .volumes
        .create(
            dir_spec(),
            Some(PathBuf::from("/etc/arbor-test")),
            engine.map.root,
            &current_cred(),
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidPath);
}

#[test]
fn link_unlink_and_last_link_destroy() {
    let (dir, engine) = test_engine();
    let target = dir.path().join("vol");
    let path = engine
        .volumes
        .create(dir_spec(), Some(target), engine.map.root, &current_cred())
        .unwrap();
    let vid = engine.volumes.resolve(&path).unwrap();

    let ct = engine.map.create("user", &current_cred()).unwrap();
    // Link without a mount target: pure membership.
    engine
        .volumes
        .link(vid, ct, PathBuf::new(), false, false)
        .unwrap();
    let err = engine
        .volumes
        .link(vid, ct, PathBuf::new(), false, false)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::VolumeAlreadyLinked);
    assert_eq!(engine.volumes.list(None, Some(ct)).len(), 1);

    // Dropping the last user link destroys the volume.
    engine.volumes.unlink(vid, ct, false).unwrap();
    assert!(engine.volumes.resolve(&path).is_err());
    assert!(engine.volumes.is_empty());
}

#[test]
fn strict_unlink_keeps_the_volume() {
    let (dir, engine) = test_engine();
    let path = engine
        .volumes
        .create(
            dir_spec(),
            Some(dir.path().join("vol")),
            engine.map.root,
            &current_cred(),
        )
        .unwrap();
    let vid = engine.volumes.resolve(&path).unwrap();
    let ct = engine.map.create("user", &current_cred()).unwrap();
    engine
        .volumes
        .link(vid, ct, PathBuf::new(), false, false)
        .unwrap();

    engine.volumes.unlink(vid, ct, true).unwrap();
    // Parked as unlinked, not destroyed.
    assert_eq!(
        engine.volumes.with(vid, |v| v.state).unwrap(),
        VolState::Unlinked
    );
    let err = engine.volumes.unlink(vid, ct, true).unwrap_err();
    assert_eq!(err.kind, ErrorKind::VolumeNotLinked);
}

#[test]
fn place_limit_blocks_oversized_volumes() {
    let (dir, engine) = test_engine();
    let ct = engine.map.create("capped", &current_cred()).unwrap();
    engine
        .map
        .with_mut(ct, |c| {
            c.place_limit.insert("total".to_string(), 1024);
        })
        .unwrap();

    // A native volume claims its space limit against the place.
    let mut properties = HashMap::new();
    properties.insert("backend".to_string(), "native".to_string());
    properties.insert("space_limit".to_string(), "1M".to_string());
    let spec = VolumeSpec::parse(&properties).unwrap();
    let err = engine
        .volumes
        .create(spec, Some(dir.path().join("vol")), ct, &current_cred())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoSpace);

    // Nothing remains charged after the failed build.
    let usage = engine
        .map
        .with(engine.map.root, |c| c.place_usage.get("total").copied())
        .unwrap();
    assert_eq!(usage.unwrap_or(0), 0);
}

#[test]
fn root_volume_dies_with_a_stop() {
    let (dir, engine) = test_engine();
    let ct = engine.map.create("vm", &current_cred()).unwrap();

    // Wire a volume the way start does for a disk-image root: owned by
    // the container, held through a target-less link of its own.
    let path = engine
        .volumes
        .create(dir_spec(), Some(dir.path().join("rootfs")), ct, &current_cred())
        .unwrap();
    let vid = engine.volumes.resolve(&path).unwrap();
    engine
        .volumes
        .link(vid, ct, PathBuf::new(), false, false)
        .unwrap();
    engine
        .map
        .with_mut(ct, |c| {
            c.root_volume = Some(vid);
            c.root_volume_path = Some(path.clone());
            c.state = arbord::container::CtState::Running;
        })
        .unwrap();

    lifecycle::stop(&engine, ct, None).unwrap();

    assert!(engine.volumes.resolve(&path).is_err(), "root volume survived stop");
    assert!(engine.volumes.is_empty());
    let (root_volume, root_volume_path) = engine
        .map
        .with(ct, |c| (c.root_volume, c.root_volume_path.clone()))
        .unwrap();
    assert!(root_volume.is_none());
    assert!(root_volume_path.is_none());
}

#[test]
fn root_volume_is_destroyed_not_reassigned_on_destroy() {
    let (dir, engine) = test_engine();
    engine.map.create("outer", &current_cred()).unwrap();
    let outer = engine.map.resolve("outer").unwrap();
    let ct = engine.map.create("outer/vm", &current_cred()).unwrap();

    let path = engine
        .volumes
        .create(dir_spec(), Some(dir.path().join("rootfs")), ct, &current_cred())
        .unwrap();
    let vid = engine.volumes.resolve(&path).unwrap();
    engine
        .volumes
        .link(vid, ct, PathBuf::new(), false, false)
        .unwrap();
    engine
        .map
        .with_mut(ct, |c| {
            c.root_volume = Some(vid);
            c.root_volume_path = Some(path.clone());
        })
        .unwrap();

    lifecycle::destroy(&engine, ct).unwrap();

    assert!(!engine.map.exists("outer/vm"));
    assert!(engine.volumes.resolve(&path).is_err(), "root volume survived destroy");
    assert!(engine.volumes.is_empty());
    // The parent must not inherit the dead container's root volume.
    let inherited = engine.map.with(outer, |c| c.owned_volumes.clone()).unwrap();
    assert!(inherited.is_empty());
}

#[test]
fn volume_record_survives_restart() {
    let (dir, engine) = test_engine();
    let target = dir.path().join("vol");
    let path = engine
        .volumes
        .create(dir_spec(), Some(target), engine.map.root, &current_cred())
        .unwrap();

    let config = engine.config.clone();
    drop(engine);
    let engine2 = arbord::daemon::Engine::new(config).unwrap();
    engine2.restore().unwrap();

    let vid = engine2.volumes.resolve(&path).unwrap();
    assert_eq!(
        engine2.volumes.with(vid, |v| v.state).unwrap(),
        VolState::Ready
    );
    assert_eq!(
        engine2.volumes.with(vid, |v| v.backend).unwrap(),
        BackendKind::Dir
    );
}
