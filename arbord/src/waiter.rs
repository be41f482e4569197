//! Lifecycle waiters.
//!
//! Clients subscribe to state transitions on exact names and wildcard
//! patterns, with optional target-state and label filters. Synchronous
//! waiters fire once and deactivate; asynchronous waiters persist until
//! removed. Timeouts are events scheduled at subscription time; firing
//! one delivers an empty name with state `"timeout"`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::container::CtState;

/// State reported when a waiter times out.
pub const TIMEOUT_STATE: &str = "timeout";

/// One delivery to a waiting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaiterFire {
    pub client_fd: i32,
    pub waiter_id: u64,
    /// Client-visible container name; empty on timeout.
    pub name: String,
    pub state: String,
    pub when_ms: u64,
}

/// A registered waiter.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub id: u64,
    pub client_fd: i32,
    /// Exact client-visible names.
    pub names: Vec<String>,
    /// Glob-style patterns (`*` and `?`).
    pub wildcards: Vec<String>,
    /// Empty means any reportable transition.
    pub target_states: Vec<String>,
    /// `label=glob` filter against container labels.
    pub label: Option<(String, String)>,
    pub asynchronous: bool,
    active: bool,
}

/// Shell-style wildcard match over full names.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    // Iterative glob with star backtracking.
    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == name[n] || pattern[p] == '?') {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

impl Waiter {
    fn matches(
        &self,
        name: &str,
        state: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> bool {
        if !self.target_states.is_empty() && !self.target_states.iter().any(|s| s == state) {
            return false;
        }
        let name_hit = self.names.iter().any(|n| n == name)
            || self.wildcards.iter().any(|w| wildcard_match(w, name));
        if !name_hit {
            return false;
        }
        if let Some((key, pattern)) = &self.label {
            match labels.get(key) {
                Some(value) => {
                    if !wildcard_match(pattern, value) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// All registered waiters.
#[derive(Debug, Default)]
pub struct WaiterSet {
    inner: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
}

impl WaiterSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        client_fd: i32,
        names: Vec<String>,
        wildcards: Vec<String>,
        target_states: Vec<String>,
        label: Option<(String, String)>,
        asynchronous: bool,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let waiter = Waiter {
            id,
            client_fd,
            names,
            wildcards,
            target_states,
            label,
            asynchronous,
            active: true,
        };
        self.inner.lock().insert(id, waiter);
        id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deactivate asynchronous waiters of one client matching any name.
    pub fn stop_async(&self, client_fd: i32, names: &[String]) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, waiter| {
            !(waiter.client_fd == client_fd
                && waiter.asynchronous
                && (names.is_empty() || waiter.names.iter().any(|n| names.contains(n))))
        });
        before - inner.len()
    }

    /// Drop every waiter of a disconnected client.
    pub fn drop_client(&self, client_fd: i32) {
        self.inner.lock().retain(|_, w| w.client_fd != client_fd);
    }

    /// Report a state transition; returns the deliveries to perform.
    /// Synchronous waiters deactivate on first match.
    pub fn notify(
        &self,
        name: &str,
        state: CtState,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> Vec<WaiterFire> {
        let state_str = state.as_str();
        let now = crate::now_ms();
        let mut fires = Vec::new();
        let mut inner = self.inner.lock();
        let mut spent = Vec::new();
        for waiter in inner.values_mut() {
            if !waiter.active || !waiter.matches(name, state_str, labels) {
                continue;
            }
            fires.push(WaiterFire {
                client_fd: waiter.client_fd,
                waiter_id: waiter.id,
                name: name.to_string(),
                state: state_str.to_string(),
                when_ms: now,
            });
            if !waiter.asynchronous {
                waiter.active = false;
                spent.push(waiter.id);
            }
        }
        for id in spent {
            inner.remove(&id);
        }
        fires
    }

    /// Fire a timeout; sync waiters die, async ones stay.
    pub fn timeout(&self, waiter_id: u64) -> Option<WaiterFire> {
        let mut inner = self.inner.lock();
        let waiter = inner.get_mut(&waiter_id)?;
        if !waiter.active {
            return None;
        }
        let fire = WaiterFire {
            client_fd: waiter.client_fd,
            waiter_id,
            name: String::new(),
            state: TIMEOUT_STATE.to_string(),
            when_ms: crate::now_ms(),
        };
        if !waiter.asynchronous {
            inner.remove(&waiter_id);
        }
        Some(fire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "a/b"));
        assert!(wildcard_match("a/*", "a/b"));
        assert!(wildcard_match("a/*", "a/b/c"));
        assert!(wildcard_match("job-??", "job-01"));
        assert!(!wildcard_match("a/*", "b/a"));
        assert!(!wildcard_match("job-?", "job-01"));
        assert!(wildcard_match("", ""));
    }

    #[test]
    fn test_sync_waiter_fires_once() {
        let set = WaiterSet::new();
        set.register(3, vec!["a".into()], vec![], vec![], None, false);

        let fires = set.notify("a", CtState::Dead, &labels(&[]));
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].state, "dead");

        // Already spent.
        assert!(set.notify("a", CtState::Stopped, &labels(&[])).is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn test_async_waiter_persists() {
        let set = WaiterSet::new();
        set.register(3, vec![], vec!["job-*".into()], vec![], None, true);
        assert_eq!(set.notify("job-1", CtState::Dead, &labels(&[])).len(), 1);
        assert_eq!(set.notify("job-2", CtState::Dead, &labels(&[])).len(), 1);
        assert_eq!(set.stop_async(3, &[]), 1);
        assert!(set.notify("job-3", CtState::Dead, &labels(&[])).is_empty());
    }

    #[test]
    fn test_target_state_filter() {
        let set = WaiterSet::new();
        set.register(
            3,
            vec!["a".into()],
            vec![],
            vec!["dead".into()],
            None,
            false,
        );
        assert!(set.notify("a", CtState::Running, &labels(&[])).is_empty());
        assert_eq!(set.notify("a", CtState::Dead, &labels(&[])).len(), 1);
    }

    #[test]
    fn test_label_filter() {
        let set = WaiterSet::new();
        set.register(
            3,
            vec![],
            vec!["*".into()],
            vec![],
            Some(("tier".into(), "db*".into())),
            true,
        );
        assert!(set
            .notify("a", CtState::Dead, &labels(&[("tier", "web")]))
            .is_empty());
        assert_eq!(
            set.notify("a", CtState::Dead, &labels(&[("tier", "db-1")]))
                .len(),
            1
        );
        assert!(set.notify("a", CtState::Dead, &labels(&[])).is_empty());
    }

    #[test]
    fn test_timeout_fires_empty_name() {
        let set = WaiterSet::new();
        let id = set.register(3, vec!["a".into()], vec![], vec![], None, false);
        let fire = set.timeout(id).unwrap();
        assert_eq!(fire.name, "");
        assert_eq!(fire.state, TIMEOUT_STATE);
        // Spent; a second timeout is a no-op.
        assert!(set.timeout(id).is_none());
    }

    #[test]
    fn test_drop_client() {
        let set = WaiterSet::new();
        set.register(3, vec!["a".into()], vec![], vec![], None, true);
        set.register(4, vec!["a".into()], vec![], vec![], None, true);
        set.drop_client(3);
        assert_eq!(set.notify("a", CtState::Dead, &labels(&[])).len(), 1);
    }
}
