//! Container tree flows: properties, persistence, exit delivery,
//! destruction.

mod common;

use arbord::container::{lifecycle, CtState};
use arbord::ErrorKind;
use common::{current_cred, test_engine};

#[test]
fn property_set_get_and_persist() {
    let (_dir, engine) = test_engine();
    let ct = engine.map.create("web", &current_cred()).unwrap();

    lifecycle::set_property(&engine, ct, "command", "sh -c 'exit 7'").unwrap();
    lifecycle::set_property(&engine, ct, "memory_limit", "64M").unwrap();
    lifecycle::set_property(&engine, ct, "respawn", "false").unwrap();

    assert_eq!(
        lifecycle::get_property(&engine, ct, "command").unwrap(),
        "sh -c 'exit 7'"
    );
    assert_eq!(
        lifecycle::get_property(&engine, ct, "memory_limit").unwrap(),
        (64u64 << 20).to_string()
    );
    assert_eq!(
        lifecycle::get_property(&engine, ct, "state").unwrap(),
        "stopped"
    );

    let err = lifecycle::get_property(&engine, ct, "no_such_thing").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidProperty);
    let err = lifecycle::set_property(&engine, ct, "state", "running").unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidProperty);

    // The KV record is on disk and holds the set values.
    let id = engine.map.with(ct, |c| c.id).unwrap();
    let record = engine.kv_containers.load(&id.to_string()).unwrap();
    assert_eq!(record.get("command").map(String::as_str), Some("sh -c 'exit 7'"));
}

#[test]
fn restore_rebuilds_equivalent_containers() {
    let (dir, engine) = test_engine();
    let ct = engine.map.create("job", &current_cred()).unwrap();
    lifecycle::set_property(&engine, ct, "command", "sleep 1").unwrap();
    lifecycle::set_property(&engine, ct, "env", "A=1;B=2").unwrap();
    lifecycle::set_property(&engine, ct, "aging_time", "60").unwrap();
    engine.map.create("job/inner", &current_cred()).unwrap();
    let inner = engine.map.resolve("job/inner").unwrap();
    engine.map.save(inner, &engine.kv_containers).unwrap();

    // A second engine over the same state dir sees the same tree.
    let config = engine.config.clone();
    drop(engine);
    let engine2 = arbord::daemon::Engine::new(config).unwrap();
    engine2.restore().unwrap();

    let ct2 = engine2.map.resolve("job").unwrap();
    assert_eq!(
        lifecycle::get_property(&engine2, ct2, "command").unwrap(),
        "sleep 1"
    );
    assert_eq!(lifecycle::get_property(&engine2, ct2, "env").unwrap(), "A=1;B=2");
    assert_eq!(
        lifecycle::get_property(&engine2, ct2, "aging_time").unwrap(),
        "60"
    );
    assert!(engine2.map.exists("job/inner"));
    drop(dir);
}

#[test]
fn exit_delivery_is_at_most_once() {
    let (_dir, engine) = test_engine();
    let ct = engine.map.create("task", &current_cred()).unwrap();
    engine
        .map
        .with_mut(ct, |c| {
            c.state = CtState::Running;
            c.task_pid = 43_210;
            c.wait_task_pid = 43_210;
        })
        .unwrap();

    engine.deliver_exit(43_210, 7 << 8);
    assert_eq!(engine.map.state_of(ct).unwrap(), CtState::Dead);
    let (status, pid) = engine
        .map
        .with(ct, |c| (c.exit_status, c.wait_task_pid))
        .unwrap();
    assert_eq!(status, 7 << 8);
    assert_eq!(pid, 0, "reap must clear the wait task");
    assert_eq!(
        lifecycle::get_property(&engine, ct, "exit_code").unwrap(),
        "7"
    );

    // Replaying the same pid finds no owner and changes nothing.
    let death = engine.map.with(ct, |c| c.death_time_ms).unwrap();
    engine.deliver_exit(43_210, 9);
    assert_eq!(engine.map.state_of(ct).unwrap(), CtState::Dead);
    assert_eq!(engine.map.with(ct, |c| c.exit_status).unwrap(), 7 << 8);
    assert_eq!(engine.map.with(ct, |c| c.death_time_ms).unwrap(), death);
}

#[test]
fn dead_container_schedules_respawn() {
    let (_dir, engine) = test_engine();
    let ct = engine.map.create("task", &current_cred()).unwrap();
    lifecycle::set_property(&engine, ct, "respawn", "true").unwrap();
    engine
        .map
        .with_mut(ct, |c| {
            c.state = CtState::Running;
            c.wait_task_pid = 777;
        })
        .unwrap();

    let before = engine.events.len();
    engine.deliver_exit(777, 0);
    assert!(engine.events.len() > before, "respawn event must be queued");
}

#[test]
fn destroy_removes_subtree_and_reuses_nothing_stale() {
    let (_dir, engine) = test_engine();
    engine.map.create("a", &current_cred()).unwrap();
    engine.map.create("a/b", &current_cred()).unwrap();
    engine.map.create("a/b/c", &current_cred()).unwrap();
    let a = engine.map.resolve("a").unwrap();
    let record_id = engine.map.with(a, |c| c.id).unwrap();
    engine.map.save(a, &engine.kv_containers).unwrap();

    lifecycle::destroy(&engine, a).unwrap();

    for name in ["a", "a/b", "a/b/c"] {
        assert!(!engine.map.exists(name), "{} survived destroy", name);
    }
    // The root only keeps the porto root as a child.
    let children = engine.map.with(engine.map.root, |c| c.children.len()).unwrap();
    assert_eq!(children, 1);
    assert!(!engine.kv_containers.exists(&record_id.to_string()));

    let err = lifecycle::destroy(&engine, engine.map.root).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permission);
}

#[test]
fn fatal_oom_kills_exactly_once() {
    let (_dir, engine) = test_engine();
    let ct = engine.map.create("hog", &current_cred()).unwrap();
    lifecycle::set_property(&engine, ct, "memory_limit", "64M").unwrap();
    engine
        .map
        .with_mut(ct, |c| {
            c.state = CtState::Running;
            c.wait_task_pid = 888;
        })
        .unwrap();

    lifecycle::handle_oom(&engine, ct).unwrap();

    assert_eq!(engine.map.state_of(ct).unwrap(), CtState::Dead);
    let (oom_killed, oom_events) = engine
        .map
        .with(ct, |c| (c.oom_killed, c.oom_events))
        .unwrap();
    assert!(oom_killed);
    assert_eq!(oom_events, 1);
    assert_eq!(
        engine.stats.snapshot()["containers_oom"], 1,
        "one oom recorded"
    );

    // A second notification against the dead container is a no-op.
    lifecycle::handle_oom(&engine, ct).unwrap();
    assert_eq!(engine.stats.snapshot()["containers_oom"], 1);
    assert_eq!(
        lifecycle::get_property(&engine, ct, "oom_killed").unwrap(),
        "true"
    );
}

#[test]
fn non_fatal_oom_only_counts() {
    let (_dir, engine) = test_engine();
    let ct = engine.map.create("soft", &current_cred()).unwrap();
    lifecycle::set_property(&engine, ct, "oom_is_fatal", "false").unwrap();
    engine
        .map
        .with_mut(ct, |c| {
            c.state = CtState::Running;
            c.wait_task_pid = 889;
        })
        .unwrap();

    lifecycle::handle_oom(&engine, ct).unwrap();
    assert_eq!(engine.map.state_of(ct).unwrap(), CtState::Running);
    assert_eq!(engine.map.with(ct, |c| c.oom_events).unwrap(), 1);
}

#[test]
fn create_requires_control_of_the_parent() {
    use arbord::client::ClientInfo;
    use arbord::container::{AccessLevel, Cred};
    use prost::Message;

    let (_dir, engine) = test_engine();
    engine.map.create("other", &Cred::new(2000, 2000)).unwrap();

    let client = |uid: u32| ClientInfo {
        fd: 7,
        peer_pid: 0,
        cred: Cred::new(uid, uid),
        ct: engine.map.root,
        access_level: AccessLevel::Normal,
        namespace: String::new(),
        client_ct_name: "/".to_string(),
    };
    let create_frame = |name: &str| {
        arbor_shared::rpc::Request {
            body: Some(arbor_shared::rpc::request::Body::Create(
                arbor_shared::rpc::CreateRequest {
                    name: name.to_string(),
                    weak: false,
                },
            )),
        }
        .encode_to_vec()
    };

    // A foreign uid cannot create children under someone else's parent.
    let response = arbord::rpc::handle_frame(&engine, &client(1000), &create_frame("other/child"));
    assert_eq!(
        ErrorKind::from_code(response.error),
        ErrorKind::Permission
    );
    assert!(!engine.map.exists("other/child"));

    // The parent's owner can.
    let response = arbord::rpc::handle_frame(&engine, &client(2000), &create_frame("other/child"));
    assert_eq!(ErrorKind::from_code(response.error), ErrorKind::Success);
    assert!(engine.map.exists("other/child"));

    // Top-level creation stays open to any writing client.
    let response = arbord::rpc::handle_frame(&engine, &client(1000), &create_frame("solo"));
    assert_eq!(ErrorKind::from_code(response.error), ErrorKind::Success);
    assert!(engine.map.exists("solo"));
}

#[test]
fn wait_fires_for_dead_container() {
    let (_dir, engine) = test_engine();
    let ct = engine.map.create("watched", &current_cred()).unwrap();
    engine.waiters.register(
        9,
        vec!["watched".to_string()],
        vec![],
        vec!["dead".to_string()],
        None,
        false,
    );
    engine
        .map
        .with_mut(ct, |c| {
            c.state = CtState::Running;
            c.wait_task_pid = 555;
        })
        .unwrap();

    engine.deliver_exit(555, 0);

    let fires = std::mem::take(&mut *engine.pending_fires.lock());
    assert_eq!(fires.len(), 1);
    assert_eq!(fires[0].name, "watched");
    assert_eq!(fires[0].state, "dead");
}
