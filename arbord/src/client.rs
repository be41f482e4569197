//! Client sessions.
//!
//! A session carries the peer's kernel-reported credentials, the
//! container it connected from, its effective access level, framed
//! read/write buffers and the weak containers it created. Names on the
//! wire are relative to the client container's porto namespace.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use arbor_shared::wire::{encode_frame, FrameDecoder};
use arbor_shared::{rpc, ArborError, ArborResult};
use nix::sys::socket::{getsockopt, sockopt};

use crate::container::{AccessLevel, Cred, CtId, CtState};
use crate::daemon::Engine;

/// One connected client.
pub struct Client {
    pub stream: UnixStream,
    pub peer_pid: u32,
    pub cred: Cred,
    /// Container the peer's task lives in.
    pub ct: CtId,
    pub access_level: AccessLevel,
    /// Porto-namespace prefix of the client container.
    pub namespace: String,
    pub client_ct_name: String,
    pub decoder: FrameDecoder,
    pub write_buf: Vec<u8>,
    /// Parsed frames awaiting their turn; one request runs at a time
    /// per client so responses keep request order.
    pub pending_frames: std::collections::VecDeque<Vec<u8>>,
    pub last_activity_ms: u64,
    pub in_flight: bool,
}

/// Cheap identity snapshot handed to request workers.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub fd: RawFd,
    pub peer_pid: u32,
    pub cred: Cred,
    pub ct: CtId,
    pub access_level: AccessLevel,
    pub namespace: String,
    pub client_ct_name: String,
}

impl ClientInfo {
    pub fn resolve_name(&self, name: &str) -> String {
        resolve_name(&self.client_ct_name, &self.namespace, name)
    }

    pub fn compose_name(&self, internal: &str) -> Option<String> {
        compose_name(&self.namespace, internal)
    }

    pub fn can_read(&self) -> ArborResult<()> {
        if self.access_level >= AccessLevel::ReadOnly {
            Ok(())
        } else {
            Err(ArborError::permission("client has no porto access"))
        }
    }

    pub fn can_control(&self, engine: &Arc<Engine>, ct: CtId) -> ArborResult<()> {
        if self.access_level >= AccessLevel::SuperUser {
            return Ok(());
        }
        if self.access_level < AccessLevel::ChildOnly {
            return Err(ArborError::permission("read-only client"));
        }
        if self.access_level == AccessLevel::ChildOnly {
            // Child-only clients may touch their own container (as the
            // parent of new children) and its subtree, nothing else.
            let target = engine.map.name_of(ct)?;
            let own = &self.client_ct_name;
            let inside = target == *own
                || target
                    .strip_prefix(own.as_str())
                    .map(|rest| rest.starts_with('/'))
                    .unwrap_or(false);
            if !inside {
                return Err(ArborError::permission(
                    "child-only client outside its subtree",
                ));
            }
        }
        let owner = engine.map.with(ct, |c| c.owner_cred.clone())?;
        if self.cred.can_control(&owner) {
            Ok(())
        } else {
            Err(ArborError::permission(format!(
                "uid {} does not own this container",
                self.cred.uid
            )))
        }
    }
}

impl Client {
    /// Identify an accepted connection.
    pub fn identify(engine: &Arc<Engine>, stream: UnixStream) -> ArborResult<Client> {
        stream
            .set_nonblocking(true)
            .map_err(|e| ArborError::from(e).context("setting nonblocking"))?;
        let creds = getsockopt(&stream, sockopt::PeerCredentials).map_err(|e| {
            ArborError::with_errno(
                arbor_shared::ErrorKind::Unknown,
                e as i32,
                format!("SO_PEERCRED: {}", e),
            )
        })?;
        let peer_pid = creds.pid() as u32;
        let cred = Cred::new(creds.uid(), creds.gid());

        let ct = engine.map.find_task_container(peer_pid);
        let (ct_name, ct_state, namespace) = engine.map.with(ct, |c| {
            (c.name.clone(), c.state, c.porto_namespace.clone())
        })?;
        if !matches!(
            ct_state,
            CtState::Running | CtState::Starting | CtState::Meta
        ) {
            return Err(ArborError::permission(format!(
                "client container {} is {}",
                ct_name, ct_state
            )));
        }
        let mut access_level = engine.map.effective_access_level(ct);
        if cred.is_root_user() && access_level < AccessLevel::SuperUser {
            access_level = AccessLevel::SuperUser;
        }

        tracing::debug!(
            pid = peer_pid,
            uid = cred.uid,
            container = %ct_name,
            level = access_level.as_str(),
            "client connected"
        );
        Ok(Client {
            stream,
            peer_pid,
            cred,
            ct,
            access_level,
            namespace,
            client_ct_name: ct_name,
            decoder: FrameDecoder::new(),
            write_buf: Vec::new(),
            pending_frames: std::collections::VecDeque::new(),
            last_activity_ms: crate::now_ms(),
            in_flight: false,
        })
    }

    /// Snapshot for the worker pool.
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            fd: self.fd(),
            peer_pid: self.peer_pid,
            cred: self.cred.clone(),
            ct: self.ct,
            access_level: self.access_level,
            namespace: self.namespace.clone(),
            client_ct_name: self.client_ct_name.clone(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Drain readable bytes; returns complete request frames.
    ///
    /// `Ok(None)` reports an orderly close; framing errors poison the
    /// connection.
    pub fn read_ready(&mut self) -> ArborResult<Option<Vec<Vec<u8>>>> {
        use std::io::Read;
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArborError::from(e).context("client read")),
            }
        }
        self.last_activity_ms = crate::now_ms();
        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.next_frame()? {
            frames.push(frame);
        }
        Ok(Some(frames))
    }

    /// Queue one response for writing.
    pub fn queue_response(&mut self, response: &rpc::Response) {
        encode_frame(response, &mut self.write_buf);
    }

    /// Flush the write buffer; returns true while bytes remain (keep
    /// EPOLLOUT armed).
    pub fn write_ready(&mut self) -> ArborResult<bool> {
        use std::io::Write;
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(ArborError::unknown("client write returned 0")),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArborError::from(e).context("client write")),
            }
        }
        Ok(false)
    }

    /// Resolve a client-relative name to an internal absolute name.
    pub fn resolve_name(&self, name: &str) -> String {
        resolve_name(&self.client_ct_name, &self.namespace, name)
    }

    /// Internal name back to the client's view; `None` when invisible.
    pub fn compose_name(&self, internal: &str) -> Option<String> {
        compose_name(&self.namespace, internal)
    }
}

/// Resolve a client-visible name against a porto namespace.
///
/// `self` names the client container, `self/x` its children, `.` its
/// parent; `/` is always the absolute root; `/porto/...` re-anchors to
/// the top; anything else gets the namespace prefix.
pub fn resolve_name(client_ct: &str, namespace: &str, name: &str) -> String {
    match name {
        "/" => "/".to_string(),
        "self" => client_ct.to_string(),
        "." => crate::util::path::parent_name(client_ct)
            .unwrap_or("/")
            .to_string(),
        _ => {
            if let Some(rest) = name.strip_prefix("self/") {
                if client_ct == "/" {
                    rest.to_string()
                } else {
                    format!("{}/{}", client_ct, rest)
                }
            } else if let Some(rest) = name.strip_prefix("/porto/") {
                rest.to_string()
            } else if name == "/porto" {
                crate::container::PORTO_ROOT_NAME.to_string()
            } else {
                format!("{}{}", namespace, name)
            }
        }
    }
}

/// Strip the namespace prefix from an internal name; names outside the
/// namespace are invisible to the client.
pub fn compose_name(namespace: &str, internal: &str) -> Option<String> {
    if internal == "/" || internal == crate::container::PORTO_ROOT_NAME {
        return Some(internal.to_string());
    }
    if namespace.is_empty() {
        return Some(internal.to_string());
    }
    internal.strip_prefix(namespace).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_absolute_and_special() {
        assert_eq!(resolve_name("a/b", "a/", "/"), "/");
        assert_eq!(resolve_name("a/b", "a/", "self"), "a/b");
        assert_eq!(resolve_name("a/b", "a/", "self/c"), "a/b/c");
        assert_eq!(resolve_name("a/b", "a/", "."), "a");
        assert_eq!(resolve_name("/", "", "."), "/");
        assert_eq!(resolve_name("a/b", "a/", "/porto"), "/porto");
        assert_eq!(resolve_name("a/b", "a/", "/porto/x/y"), "x/y");
    }

    #[test]
    fn test_resolve_namespace_prefix() {
        assert_eq!(resolve_name("a/b", "a/", "c"), "a/c");
        assert_eq!(resolve_name("a/b", "", "c"), "c");
        assert_eq!(resolve_name("/", "", "c/d"), "c/d");
    }

    #[test]
    fn test_compose_is_inverse() {
        for (ns, internal, visible) in [
            ("a/", "a/c", Some("c")),
            ("a/", "b/c", None),
            ("", "a/c", Some("a/c")),
            ("a/", "/", Some("/")),
            ("a/", "/porto", Some("/porto")),
        ] {
            assert_eq!(compose_name(ns, internal).as_deref(), visible);
        }
        // resolve then compose round-trips within the namespace.
        let internal = resolve_name("a/b", "a/", "c/d");
        assert_eq!(compose_name("a/", &internal).as_deref(), Some("c/d"));
    }
}
