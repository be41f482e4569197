//! Container properties.
//!
//! Every property lives in one flat descriptor table: name, flags, a
//! getter, an optional setter and an optional start hook that finalizes
//! defaults when the container starts. The same table drives RPC
//! get/set, KV persistence and restore.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use arbor_shared::{ArborError, ArborResult};

use super::capabilities::CapSet;
use super::{AccessLevel, BindMount, Container, CtState, Ulimit, VirtMode};
use crate::cgroup::Controllers;
use crate::kv::KvRecord;
use crate::net::NetMode;

/// One property of the process-wide descriptor table.
pub struct PropDescriptor {
    pub name: &'static str,
    /// Bit index into `Container::props_set`.
    pub index: u32,
    /// May be changed while the container is running or paused.
    pub dynamic: bool,
    pub read_only: bool,
    /// Included in the KV record.
    pub persist: bool,
    pub get: fn(&Container) -> ArborResult<String>,
    pub set: Option<fn(&mut Container, &str) -> ArborResult<()>>,
    /// Runs on Start to finalize defaults.
    pub start: Option<fn(&mut Container) -> ArborResult<()>>,
}

impl Container {
    pub fn prop_is_set(&self, desc: &PropDescriptor) -> bool {
        self.props_set & (1u64 << desc.index) != 0
    }

    pub fn mark_prop_set(&mut self, desc: &PropDescriptor) {
        self.props_set |= 1u64 << desc.index;
    }
}

pub fn descriptors() -> &'static [PropDescriptor] {
    static TABLE: OnceLock<Vec<PropDescriptor>> = OnceLock::new();
    TABLE.get_or_init(build_table).as_slice()
}

pub fn find(name: &str) -> Option<&'static PropDescriptor> {
    descriptors().iter().find(|desc| desc.name == name)
}

// ---------------------------------------------------------------------------
// value parsing helpers

/// Parse a byte size with optional K/M/G/T suffix; 0 means unlimited.
pub fn parse_size(text: &str) -> ArborResult<u64> {
    let text = text.trim();
    if text.is_empty() || text == "0" {
        return Ok(0);
    }
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&text[..text.len() - 1], 10),
        Some(b'M') | Some(b'm') => (&text[..text.len() - 1], 20),
        Some(b'G') | Some(b'g') => (&text[..text.len() - 1], 30),
        Some(b'T') | Some(b't') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ArborError::invalid_value(format!("bad size {:?}", text)))?;
    value
        .checked_shl(shift)
        .ok_or_else(|| ArborError::invalid_value(format!("size {:?} overflows", text)))
}

pub fn parse_bool(text: &str) -> ArborResult<bool> {
    match text.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ArborError::invalid_value(format!("bad boolean {:?}", other))),
    }
}

fn format_bool(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn parse_uid(text: &str) -> ArborResult<u32> {
    let text = text.trim();
    if let Ok(uid) = text.parse::<u32>() {
        return Ok(uid);
    }
    match nix::unistd::User::from_name(text) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(ArborError::invalid_value(format!("unknown user {:?}", text))),
    }
}

fn parse_gid(text: &str) -> ArborResult<u32> {
    let text = text.trim();
    if let Ok(gid) = text.parse::<u32>() {
        return Ok(gid);
    }
    match nix::unistd::Group::from_name(text) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        _ => Err(ArborError::invalid_value(format!("unknown group {:?}", text))),
    }
}

fn parse_cpu(text: &str) -> ArborResult<f64> {
    let text = text.trim();
    let digits = text.strip_suffix('c').unwrap_or(text);
    let cores: f64 = digits
        .trim()
        .parse()
        .map_err(|_| ArborError::invalid_value(format!("bad cpu value {:?}", text)))?;
    if cores < 0.0 {
        return Err(ArborError::invalid_value("cpu value must be non-negative"));
    }
    Ok(cores)
}

fn format_cpu(cores: f64) -> String {
    format!("{}c", cores)
}

fn parse_bind_list(text: &str) -> ArborResult<Vec<BindMount>> {
    let mut mounts = Vec::new();
    for entry in text.split(';').filter(|e| !e.trim().is_empty()) {
        let words: Vec<&str> = entry.split_whitespace().collect();
        let (source, target, flags) = match words.as_slice() {
            [source, target] => (source, target, ""),
            [source, target, flags] => (source, target, *flags),
            _ => {
                return Err(ArborError::invalid_value(format!(
                    "bad bind entry {:?}",
                    entry
                )))
            }
        };
        let read_only = match flags {
            "" | "rw" => false,
            "ro" => true,
            other => {
                return Err(ArborError::invalid_value(format!(
                    "bad bind flag {:?}",
                    other
                )))
            }
        };
        mounts.push(BindMount {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            read_only,
        });
    }
    Ok(mounts)
}

fn format_bind_list(mounts: &[BindMount]) -> String {
    mounts
        .iter()
        .map(|m| {
            format!(
                "{} {} {}",
                m.source.display(),
                m.target.display(),
                if m.read_only { "ro" } else { "rw" }
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_ulimits(text: &str) -> ArborResult<Vec<Ulimit>> {
    let mut ulimits = Vec::new();
    for entry in text.split(';').filter(|e| !e.trim().is_empty()) {
        let words: Vec<&str> = entry.split_whitespace().collect();
        let [name, soft, hard] = words.as_slice() else {
            return Err(ArborError::invalid_value(format!(
                "bad ulimit entry {:?}",
                entry
            )));
        };
        let parse = |value: &str| -> ArborResult<u64> {
            if value == "unlimited" {
                Ok(u64::MAX)
            } else {
                value
                    .parse()
                    .map_err(|_| ArborError::invalid_value(format!("bad ulimit value {:?}", value)))
            }
        };
        ulimits.push(Ulimit {
            name: name.to_string(),
            soft: parse(soft)?,
            hard: parse(hard)?,
        });
    }
    Ok(ulimits)
}

fn format_ulimits(ulimits: &[Ulimit]) -> String {
    let show = |value: u64| {
        if value == u64::MAX {
            "unlimited".to_string()
        } else {
            value.to_string()
        }
    };
    ulimits
        .iter()
        .map(|u| format!("{} {} {}", u.name, show(u.soft), show(u.hard)))
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_string_map(text: &str) -> ArborResult<std::collections::BTreeMap<String, String>> {
    let mut map = std::collections::BTreeMap::new();
    for entry in text.split(';').filter(|e| !e.trim().is_empty()) {
        let (key, value) = entry.split_once(':').ok_or_else(|| {
            ArborError::invalid_value(format!("bad map entry {:?}, want key: value", entry))
        })?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

fn format_string_map(map: &std::collections::BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}

fn parse_place_limit(
    text: &str,
) -> ArborResult<std::collections::BTreeMap<String, u64>> {
    let mut map = std::collections::BTreeMap::new();
    for (key, value) in parse_string_map(text)? {
        map.insert(key, parse_size(&value)?);
    }
    Ok(map)
}

fn format_place_limit(map: &std::collections::BTreeMap<String, u64>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join("; ")
}

fn split_list(text: &str) -> Vec<String> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// the table

fn build_table() -> Vec<PropDescriptor> {
    let mut index = 0u32;
    let mut table = Vec::new();
    let mut push = |name: &'static str,
                    dynamic: bool,
                    read_only: bool,
                    persist: bool,
                    get: fn(&Container) -> ArborResult<String>,
                    set: Option<fn(&mut Container, &str) -> ArborResult<()>>,
                    start: Option<fn(&mut Container) -> ArborResult<()>>| {
        table.push(PropDescriptor {
            name,
            index,
            dynamic,
            read_only,
            persist,
            get,
            set,
            start,
        });
        index += 1;
    };

    push(
        "command",
        false,
        false,
        true,
        |ct| Ok(ct.command.clone()),
        Some(|ct, v| {
            ct.command = v.to_string();
            Ok(())
        }),
        None,
    );
    push(
        "env",
        false,
        false,
        true,
        |ct| Ok(ct.env.join(";")),
        Some(|ct, v| {
            for entry in split_list(v) {
                if !entry.contains('=') {
                    return Err(ArborError::invalid_value(format!(
                        "bad env entry {:?}, want NAME=value",
                        entry
                    )));
                }
            }
            ct.env = split_list(v);
            Ok(())
        }),
        None,
    );
    push(
        "cwd",
        false,
        false,
        true,
        |ct| Ok(ct.cwd.display().to_string()),
        Some(|ct, v| {
            ct.cwd = PathBuf::from(v);
            Ok(())
        }),
        None,
    );
    push(
        "root",
        false,
        false,
        true,
        |ct| Ok(ct.root_path.display().to_string()),
        Some(|ct, v| {
            if ct.volume_mounts > 0 {
                return Err(ArborError::busy(format!(
                    "{} volume links are mounted under the current root",
                    ct.volume_mounts
                )));
            }
            let path = crate::util::path::normalize(std::path::Path::new(v));
            crate::util::path::require_normal_absolute(&path)?;
            ct.root_path = path;
            Ok(())
        }),
        None,
    );
    push(
        "root_readonly",
        false,
        false,
        true,
        |ct| Ok(format_bool(ct.root_ro)),
        Some(|ct, v| {
            ct.root_ro = parse_bool(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "isolate",
        false,
        false,
        true,
        |ct| Ok(format_bool(ct.isolate)),
        Some(|ct, v| {
            ct.isolate = parse_bool(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "virt_mode",
        false,
        false,
        true,
        |ct| Ok(ct.virt_mode.as_str().to_string()),
        Some(|ct, v| {
            ct.virt_mode = match v {
                "app" => VirtMode::App,
                "os" => VirtMode::Os,
                other => {
                    return Err(ArborError::invalid_value(format!(
                        "unknown virt mode {:?}",
                        other
                    )))
                }
            };
            Ok(())
        }),
        None,
    );
    push(
        "hostname",
        false,
        false,
        true,
        |ct| Ok(ct.hostname.clone().unwrap_or_default()),
        Some(|ct, v| {
            ct.hostname = if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            };
            Ok(())
        }),
        None,
    );
    push(
        "resolv_conf",
        false,
        false,
        true,
        |ct| Ok(ct.resolv_conf.clone().unwrap_or_default()),
        Some(|ct, v| {
            ct.resolv_conf = if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            };
            Ok(())
        }),
        None,
    );
    push(
        "etc_hosts",
        false,
        false,
        true,
        |ct| Ok(ct.etc_hosts.clone().unwrap_or_default()),
        Some(|ct, v| {
            ct.etc_hosts = if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            };
            Ok(())
        }),
        None,
    );
    push(
        "bind",
        false,
        false,
        true,
        |ct| Ok(format_bind_list(&ct.bind_mounts)),
        Some(|ct, v| {
            ct.bind_mounts = parse_bind_list(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "net",
        false,
        false,
        true,
        |ct| Ok(ct.net.format()),
        Some(|ct, v| {
            ct.net = NetMode::parse(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "ip",
        false,
        false,
        true,
        |ct| Ok(ct.ip_list.join(";")),
        Some(|ct, v| {
            ct.ip_list = split_list(v);
            Ok(())
        }),
        None,
    );
    push(
        "default_gw",
        false,
        false,
        true,
        |ct| Ok(ct.default_gw.join(";")),
        Some(|ct, v| {
            ct.default_gw = split_list(v);
            Ok(())
        }),
        None,
    );
    push(
        "ulimit",
        true,
        false,
        true,
        |ct| Ok(format_ulimits(&ct.ulimits)),
        Some(|ct, v| {
            ct.ulimits = parse_ulimits(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "devices",
        true,
        false,
        true,
        |ct| Ok(ct.devices.join(";")),
        Some(|ct, v| {
            ct.devices = split_list(v);
            Ok(())
        }),
        None,
    );
    push(
        "controllers",
        false,
        false,
        true,
        |ct| Ok(ct.controllers.to_string()),
        Some(|ct, v| {
            let mask: Controllers = v.parse()?;
            // Ancestor controllers must stay a superset of descendants'.
            ct.controllers = mask | Controllers::required();
            Ok(())
        }),
        None,
    );
    push(
        "memory_limit",
        true,
        false,
        true,
        |ct| Ok(ct.memory_limit.to_string()),
        Some(|ct, v| {
            ct.memory_limit = parse_size(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "memory_guarantee",
        true,
        false,
        true,
        |ct| Ok(ct.memory_guarantee.to_string()),
        Some(|ct, v| {
            ct.memory_guarantee = parse_size(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "cpu_limit",
        true,
        false,
        true,
        |ct| Ok(format_cpu(ct.cpu_limit_cores)),
        Some(|ct, v| {
            ct.cpu_limit_cores = parse_cpu(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "cpu_guarantee",
        true,
        false,
        true,
        |ct| Ok(format_cpu(ct.cpu_guarantee_cores)),
        Some(|ct, v| {
            ct.cpu_guarantee_cores = parse_cpu(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "io_limit",
        true,
        false,
        true,
        |ct| Ok(ct.io_limit.to_string()),
        Some(|ct, v| {
            ct.io_limit = parse_size(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "io_ops_limit",
        true,
        false,
        true,
        |ct| Ok(ct.io_ops_limit.to_string()),
        Some(|ct, v| {
            ct.io_ops_limit = parse_size(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "net_limit",
        true,
        false,
        true,
        |ct| Ok(ct.net_limit.to_string()),
        Some(|ct, v| {
            ct.net_limit = parse_size(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "net_guarantee",
        true,
        false,
        true,
        |ct| Ok(ct.net_guarantee.to_string()),
        Some(|ct, v| {
            ct.net_guarantee = parse_size(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "thread_limit",
        true,
        false,
        true,
        |ct| Ok(ct.thread_limit.to_string()),
        Some(|ct, v| {
            ct.thread_limit = parse_size(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "oom_is_fatal",
        true,
        false,
        true,
        |ct| Ok(format_bool(ct.oom_is_fatal)),
        Some(|ct, v| {
            ct.oom_is_fatal = parse_bool(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "oom_score_adj",
        true,
        false,
        true,
        |ct| Ok(ct.oom_score_adj.to_string()),
        Some(|ct, v| {
            let adj: i32 = v
                .trim()
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("bad oom_score_adj {:?}", v)))?;
            if !(-1000..=1000).contains(&adj) {
                return Err(ArborError::invalid_value("oom_score_adj outside [-1000, 1000]"));
            }
            ct.oom_score_adj = adj;
            Ok(())
        }),
        None,
    );
    push(
        "respawn",
        true,
        false,
        true,
        |ct| Ok(format_bool(ct.respawn)),
        Some(|ct, v| {
            ct.respawn = parse_bool(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "max_respawns",
        true,
        false,
        true,
        |ct| Ok(ct.max_respawns.to_string()),
        Some(|ct, v| {
            ct.max_respawns = v
                .trim()
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("bad max_respawns {:?}", v)))?;
            Ok(())
        }),
        None,
    );
    push(
        "respawn_delay",
        true,
        false,
        true,
        |ct| Ok(ct.respawn_delay_ms.to_string()),
        Some(|ct, v| {
            ct.respawn_delay_ms = v
                .trim()
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("bad respawn_delay {:?}", v)))?;
            Ok(())
        }),
        None,
    );
    push(
        "aging_time",
        true,
        false,
        true,
        |ct| Ok((ct.aging_time_ms / 1000).to_string()),
        Some(|ct, v| {
            let seconds: u64 = v
                .trim()
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("bad aging_time {:?}", v)))?;
            ct.aging_time_ms = seconds.saturating_mul(1000);
            Ok(())
        }),
        None,
    );
    push(
        "porto_namespace",
        false,
        false,
        true,
        |ct| Ok(ct.porto_namespace.clone()),
        Some(|ct, v| {
            ct.porto_namespace = v.to_string();
            Ok(())
        }),
        // Isolated access confines clients to the container's own subtree.
        Some(|ct| {
            let desc = find("porto_namespace").expect("table");
            if !ct.prop_is_set(desc)
                && matches!(
                    ct.access_level,
                    AccessLevel::Isolate | AccessLevel::ReadIsolate
                )
            {
                ct.porto_namespace = format!("{}/", ct.name);
            }
            Ok(())
        }),
    );
    push(
        "enable_porto",
        false,
        false,
        true,
        |ct| Ok(ct.access_level.as_str().to_string()),
        Some(|ct, v| {
            ct.access_level = v.parse()?;
            Ok(())
        }),
        None,
    );
    push(
        "private",
        true,
        false,
        true,
        |ct| Ok(ct.private.clone()),
        Some(|ct, v| {
            ct.private = v.to_string();
            Ok(())
        }),
        None,
    );
    push(
        "weak",
        true,
        false,
        true,
        |ct| Ok(format_bool(ct.weak)),
        Some(|ct, v| {
            ct.weak = parse_bool(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "user",
        false,
        false,
        true,
        |ct| Ok(ct.task_cred.uid.to_string()),
        Some(|ct, v| {
            ct.task_cred.uid = parse_uid(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "group",
        false,
        false,
        true,
        |ct| Ok(ct.task_cred.gid.to_string()),
        Some(|ct, v| {
            ct.task_cred.gid = parse_gid(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "owner_user",
        false,
        false,
        true,
        |ct| Ok(ct.owner_cred.uid.to_string()),
        Some(|ct, v| {
            ct.owner_cred.uid = parse_uid(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "owner_group",
        false,
        false,
        true,
        |ct| Ok(ct.owner_cred.gid.to_string()),
        Some(|ct, v| {
            ct.owner_cred.gid = parse_gid(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "capabilities",
        false,
        false,
        true,
        |ct| {
            Ok(ct
                .cap_limit
                .as_ref()
                .map(CapSet::format)
                .unwrap_or_default())
        },
        Some(|ct, v| {
            ct.cap_limit = if v.is_empty() {
                None
            } else {
                Some(CapSet::parse(v)?)
            };
            Ok(())
        }),
        None,
    );
    push(
        "capabilities_ambient",
        false,
        false,
        true,
        |ct| Ok(ct.cap_ambient.format()),
        Some(|ct, v| {
            ct.cap_ambient = CapSet::parse(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "place",
        false,
        false,
        true,
        |ct| {
            Ok(ct
                .place_list
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(";"))
        },
        Some(|ct, v| {
            ct.place_list = split_list(v).into_iter().map(PathBuf::from).collect();
            Ok(())
        }),
        None,
    );
    push(
        "place_limit",
        true,
        false,
        true,
        |ct| Ok(format_place_limit(&ct.place_limit)),
        Some(|ct, v| {
            ct.place_limit = parse_place_limit(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "labels",
        true,
        false,
        true,
        |ct| Ok(format_string_map(&ct.labels)),
        Some(|ct, v| {
            ct.labels = parse_string_map(v)?;
            Ok(())
        }),
        None,
    );
    push(
        "stdout_path",
        false,
        false,
        true,
        |ct| {
            Ok(ct
                .stdout_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default())
        },
        Some(|ct, v| {
            ct.stdout_path = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
            Ok(())
        }),
        None,
    );
    push(
        "stderr_path",
        false,
        false,
        true,
        |ct| {
            Ok(ct
                .stderr_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default())
        },
        Some(|ct, v| {
            ct.stderr_path = if v.is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
            Ok(())
        }),
        None,
    );

    // Read-only views.
    push(
        "state",
        false,
        true,
        false,
        |ct| Ok(ct.state.to_string()),
        None,
        None,
    );
    push(
        "id",
        false,
        true,
        false,
        |ct| Ok(ct.id.to_string()),
        None,
        None,
    );
    push(
        "level",
        false,
        true,
        false,
        |ct| Ok(ct.level.to_string()),
        None,
        None,
    );
    push(
        "absolute_name",
        false,
        true,
        false,
        |ct| Ok(ct.name.clone()),
        None,
        None,
    );
    push(
        "parent",
        false,
        true,
        false,
        |ct| {
            Ok(crate::util::path::parent_name(&ct.name)
                .unwrap_or("/")
                .to_string())
        },
        None,
        None,
    );
    push(
        "root_pid",
        false,
        true,
        false,
        |ct| Ok(ct.task_pid.to_string()),
        None,
        None,
    );
    push(
        "exit_status",
        false,
        true,
        false,
        |ct| {
            if ct.state == CtState::Dead {
                Ok(ct.exit_status.to_string())
            } else {
                Err(ArborError::invalid_state(format!(
                    "container {} is not dead",
                    ct.name
                )))
            }
        },
        None,
        None,
    );
    push(
        "exit_code",
        false,
        true,
        false,
        |ct| {
            if ct.state != CtState::Dead {
                return Err(ArborError::invalid_state(format!(
                    "container {} is not dead",
                    ct.name
                )));
            }
            // Shell convention: 128+sig for signals, else the code.
            let status = ct.exit_status;
            let code = if ct.oom_killed {
                -99
            } else if libc::WIFSIGNALED(status) {
                128 + libc::WTERMSIG(status)
            } else {
                libc::WEXITSTATUS(status)
            };
            Ok(code.to_string())
        },
        None,
        None,
    );
    push(
        "oom_killed",
        false,
        true,
        false,
        |ct| Ok(format_bool(ct.oom_killed)),
        None,
        None,
    );
    push(
        "oom_kills",
        false,
        true,
        false,
        |ct| Ok(ct.oom_events.to_string()),
        None,
        None,
    );
    push(
        "respawn_count",
        false,
        true,
        false,
        |ct| Ok(ct.respawn_count.to_string()),
        None,
        None,
    );
    push(
        "creation_time",
        false,
        true,
        false,
        |ct| Ok(ct.creation_time_ms.to_string()),
        None,
        None,
    );
    push(
        "start_time",
        false,
        true,
        false,
        |ct| Ok(ct.start_time_ms.to_string()),
        None,
        None,
    );
    push(
        "death_time",
        false,
        true,
        false,
        |ct| Ok(ct.death_time_ms.to_string()),
        None,
        None,
    );
    push(
        "time",
        false,
        true,
        false,
        |ct| {
            let uptime_ms = match ct.state {
                CtState::Running | CtState::Meta | CtState::Paused => {
                    crate::now_ms().saturating_sub(ct.start_time_ms)
                }
                CtState::Dead => ct.death_time_ms.saturating_sub(ct.start_time_ms),
                _ => 0,
            };
            Ok((uptime_ms / 1000).to_string())
        },
        None,
        None,
    );

    table
}

// ---------------------------------------------------------------------------
// persistence

/// Extra KV keys not driven by the descriptor table.
const KV_NAME: &str = "name";
const KV_STATE: &str = "state";
const KV_EXIT_STATUS: &str = "exit_status";
const KV_OOM_KILLED: &str = "oom_killed";
const KV_START_TIME: &str = "start_time_ms";
const KV_DEATH_TIME: &str = "death_time_ms";
const KV_CREATION_TIME: &str = "creation_time_ms";
const KV_RESPAWN_COUNT: &str = "respawn_count";
const KV_TASK_PID: &str = "task_pid";
const KV_WAIT_TASK_PID: &str = "wait_task_pid";
const KV_PROPS_SET: &str = "_set";

/// Serialize a container's persisted fields.
pub fn serialize(ct: &Container) -> ArborResult<KvRecord> {
    let mut record = KvRecord::new();
    record.insert(KV_NAME.to_string(), ct.name.clone());
    record.insert(KV_STATE.to_string(), ct.state.to_string());
    record.insert(KV_EXIT_STATUS.to_string(), ct.exit_status.to_string());
    record.insert(KV_OOM_KILLED.to_string(), format_bool(ct.oom_killed));
    record.insert(KV_START_TIME.to_string(), ct.start_time_ms.to_string());
    record.insert(KV_DEATH_TIME.to_string(), ct.death_time_ms.to_string());
    record.insert(
        KV_CREATION_TIME.to_string(),
        ct.creation_time_ms.to_string(),
    );
    record.insert(KV_RESPAWN_COUNT.to_string(), ct.respawn_count.to_string());
    record.insert(KV_TASK_PID.to_string(), ct.task_pid.to_string());
    record.insert(KV_WAIT_TASK_PID.to_string(), ct.wait_task_pid.to_string());
    record.insert(KV_PROPS_SET.to_string(), format!("{:x}", ct.props_set));
    for desc in descriptors() {
        if desc.persist {
            record.insert(desc.name.to_string(), (desc.get)(ct)?);
        }
    }
    Ok(record)
}

/// Populate a fresh container from a KV record.
pub fn deserialize(ct: &mut Container, record: &KvRecord) -> ArborResult<()> {
    for desc in descriptors() {
        if !desc.persist {
            continue;
        }
        if let (Some(value), Some(set)) = (record.get(desc.name), desc.set) {
            set(ct, value).map_err(|e| e.context(format!("restoring {}", desc.name)))?;
        }
    }
    if let Some(state) = record.get(KV_STATE) {
        ct.state = state.parse()?;
    }
    let parse_u64 = |key: &str| -> u64 {
        record
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    };
    ct.exit_status = record
        .get(KV_EXIT_STATUS)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    ct.oom_killed = record
        .get(KV_OOM_KILLED)
        .map(|v| v == "true")
        .unwrap_or(false);
    ct.start_time_ms = parse_u64(KV_START_TIME);
    ct.death_time_ms = parse_u64(KV_DEATH_TIME);
    if record.contains_key(KV_CREATION_TIME) {
        ct.creation_time_ms = parse_u64(KV_CREATION_TIME);
    }
    ct.respawn_count = parse_u64(KV_RESPAWN_COUNT);
    ct.task_pid = parse_u64(KV_TASK_PID) as u32;
    ct.wait_task_pid = parse_u64(KV_WAIT_TASK_PID) as u32;
    if let Some(mask) = record.get(KV_PROPS_SET) {
        ct.props_set = u64::from_str_radix(mask, 16).unwrap_or(0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;

    fn fresh(name: &str) -> Container {
        Container::new(5, name.to_string(), None, 1)
    }

    #[test]
    fn test_table_names_unique() {
        let mut names = std::collections::HashSet::new();
        for desc in descriptors() {
            assert!(names.insert(desc.name), "duplicate property {}", desc.name);
            assert!(desc.index < 64, "props_set mask overflow");
            if desc.read_only {
                assert!(desc.set.is_none());
            }
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("2K").unwrap(), 2048);
        assert_eq!(parse_size("1M").unwrap(), 1 << 20);
        assert_eq!(parse_size("3G").unwrap(), 3 << 30);
        assert!(parse_size("x").is_err());
        assert!(parse_size("1Q").is_err());
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut ct = fresh("t");
        for (name, value) in [
            ("command", "sleep 1000"),
            ("env", "A=1;B=2"),
            ("memory_limit", "1048576"),
            ("cpu_limit", "1.5c"),
            ("bind", "/src /dst ro"),
            ("ulimit", "nofile 1024 2048"),
            ("net", "veth eth0"),
            ("labels", "team: infra; tier: db"),
            ("enable_porto", "read-only"),
        ] {
            let desc = find(name).unwrap_or_else(|| panic!("no descriptor {}", name));
            (desc.set.unwrap())(&mut ct, value).unwrap();
            let back = (desc.get)(&ct).unwrap();
            let again = {
                (desc.set.unwrap())(&mut ct, &back).unwrap();
                (desc.get)(&ct).unwrap()
            };
            assert_eq!(back, again, "property {} does not roundtrip", name);
        }
    }

    #[test]
    fn test_root_change_blocked_by_mounts() {
        let mut ct = fresh("t");
        ct.volume_mounts = 1;
        let desc = find("root").unwrap();
        let err = (desc.set.unwrap())(&mut ct, "/chroot").unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::Busy);
    }

    #[test]
    fn test_root_rejects_dotdot() {
        let mut ct = fresh("t");
        let desc = find("root").unwrap();
        assert!((desc.set.unwrap())(&mut ct, "/a/../b").is_err());
        assert!((desc.set.unwrap())(&mut ct, "relative").is_err());
    }

    #[test]
    fn test_serialize_deserialize_equivalent() {
        let mut ct = fresh("t");
        for (name, value) in [
            ("command", "echo hi"),
            ("env", "X=y"),
            ("memory_limit", "67108864"),
            ("respawn", "true"),
            ("isolate", "false"),
            ("weak", "true"),
            ("place_limit", "total: 1073741824"),
        ] {
            let desc = find(name).unwrap();
            (desc.set.unwrap())(&mut ct, value).unwrap();
            ct.mark_prop_set(desc);
        }
        ct.state = CtState::Dead;
        ct.exit_status = 7 << 8;
        ct.respawn_count = 3;

        let record = serialize(&ct).unwrap();
        let mut back = fresh("t");
        deserialize(&mut back, &record).unwrap();

        for desc in descriptors() {
            if desc.persist {
                assert_eq!(
                    (desc.get)(&ct).unwrap(),
                    (desc.get)(&back).unwrap(),
                    "property {} differs after restore",
                    desc.name
                );
            }
        }
        assert_eq!(back.state, CtState::Dead);
        assert_eq!(back.exit_status, 7 << 8);
        assert_eq!(back.respawn_count, 3);
        assert_eq!(back.props_set, ct.props_set);
    }

    #[test]
    fn test_exit_status_requires_dead() {
        let ct = fresh("t");
        let desc = find("exit_status").unwrap();
        assert!((desc.get)(&ct).is_err());
    }
}
