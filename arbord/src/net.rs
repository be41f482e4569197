//! Network configuration of containers.
//!
//! The daemon only parses and validates the declared configuration and
//! allocates traffic-class handles; actual qdisc/class programming is an
//! external capability behind [`TrafficShaper`].

use arbor_shared::{ArborError, ArborResult};

/// Declared network mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetMode {
    /// Share the parent's namespace.
    #[default]
    Inherited,
    /// Fresh empty namespace with only loopback.
    None,
    Macvlan {
        master: String,
        name: String,
    },
    Ipvlan {
        master: String,
        name: String,
    },
    Veth {
        name: String,
    },
    L3 {
        name: String,
    },
    Ipip6 {
        name: String,
        remote: String,
        local: String,
    },
}

impl NetMode {
    /// True when the container gets a namespace of its own.
    pub fn is_isolated(&self) -> bool {
        !matches!(self, NetMode::Inherited)
    }

    pub fn parse(text: &str) -> ArborResult<NetMode> {
        let mut words = text.split_whitespace();
        let kind = words.next().unwrap_or("inherited");
        let mode = match kind {
            "inherited" => NetMode::Inherited,
            "none" => NetMode::None,
            "macvlan" => NetMode::Macvlan {
                master: required(&mut words, "macvlan master")?,
                name: required(&mut words, "macvlan name")?,
            },
            "ipvlan" => NetMode::Ipvlan {
                master: required(&mut words, "ipvlan master")?,
                name: required(&mut words, "ipvlan name")?,
            },
            "veth" => NetMode::Veth {
                name: required(&mut words, "veth name")?,
            },
            "L3" | "l3" => NetMode::L3 {
                name: required(&mut words, "L3 name")?,
            },
            "ipip6" => NetMode::Ipip6 {
                name: required(&mut words, "ipip6 name")?,
                remote: required(&mut words, "ipip6 remote")?,
                local: required(&mut words, "ipip6 local")?,
            },
            other => {
                return Err(ArborError::invalid_value(format!(
                    "unknown network mode {:?}",
                    other
                )))
            }
        };
        if words.next().is_some() {
            return Err(ArborError::invalid_value(format!(
                "trailing words in network config {:?}",
                text
            )));
        }
        Ok(mode)
    }

    pub fn format(&self) -> String {
        match self {
            NetMode::Inherited => "inherited".to_string(),
            NetMode::None => "none".to_string(),
            NetMode::Macvlan { master, name } => format!("macvlan {} {}", master, name),
            NetMode::Ipvlan { master, name } => format!("ipvlan {} {}", master, name),
            NetMode::Veth { name } => format!("veth {}", name),
            NetMode::L3 { name } => format!("L3 {}", name),
            NetMode::Ipip6 {
                name,
                remote,
                local,
            } => format!("ipip6 {} {} {}", name, remote, local),
        }
    }
}

/// netcls handle of a container: fixed major, minor = container id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcHandle {
    pub major: u16,
    pub minor: u16,
}

/// Major of every container class.
pub const TC_MAJOR: u16 = 1;

impl TcHandle {
    pub fn for_container(id: u32) -> Self {
        Self {
            major: TC_MAJOR,
            minor: id as u16,
        }
    }

    /// Value written into `net_cls.classid`.
    pub fn classid(self) -> u32 {
        (u32::from(self.major) << 16) | u32::from(self.minor)
    }
}

/// Capability interface: apply a traffic-class tree to an interface.
pub trait TrafficShaper: Send + Sync {
    fn apply_class(&self, iface: &str, handle: TcHandle, limit: u64, guarantee: u64)
        -> ArborResult<()>;
    fn remove_class(&self, iface: &str, handle: TcHandle) -> ArborResult<()>;
}

/// Default shaper used when no programmer is wired in; records intent.
#[derive(Debug, Default)]
pub struct NullShaper;

impl TrafficShaper for NullShaper {
    fn apply_class(
        &self,
        iface: &str,
        handle: TcHandle,
        limit: u64,
        guarantee: u64,
    ) -> ArborResult<()> {
        tracing::debug!(iface, classid = handle.classid(), limit, guarantee, "tc apply skipped");
        Ok(())
    }

    fn remove_class(&self, iface: &str, handle: TcHandle) -> ArborResult<()> {
        tracing::debug!(iface, classid = handle.classid(), "tc remove skipped");
        Ok(())
    }
}

fn required(words: &mut std::str::SplitWhitespace<'_>, what: &str) -> ArborResult<String> {
    words
        .next()
        .map(str::to_string)
        .ok_or_else(|| ArborError::invalid_value(format!("missing {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_roundtrip() {
        for text in [
            "inherited",
            "none",
            "macvlan eth0 eth0",
            "ipvlan eth0 eth1",
            "veth eth0",
            "L3 eth0",
            "ipip6 tun0 fc00::1 fc00::2",
        ] {
            let mode = NetMode::parse(text).unwrap();
            assert_eq!(NetMode::parse(&mode.format()).unwrap(), mode);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(NetMode::parse("macvlan").is_err());
        assert!(NetMode::parse("bridge br0").is_err());
        assert!(NetMode::parse("none extra").is_err());
    }

    #[test]
    fn test_isolation() {
        assert!(!NetMode::Inherited.is_isolated());
        assert!(NetMode::None.is_isolated());
        assert!(NetMode::parse("veth eth0").unwrap().is_isolated());
    }

    #[test]
    fn test_tc_handle() {
        let handle = TcHandle::for_container(7);
        assert_eq!(handle.classid(), 0x0001_0007);
    }
}
