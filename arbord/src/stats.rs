//! Process-wide statistics.
//!
//! Grouped into the engine context instead of free globals so tests can
//! instantiate fresh counters. Exposed over RPC and in the SIGUSR2 dump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Statistics {
    pub containers_created: AtomicU64,
    pub containers_started: AtomicU64,
    pub containers_failed_start: AtomicU64,
    pub containers_oom: AtomicU64,
    pub containers_respawned: AtomicU64,
    pub containers_destroyed: AtomicU64,
    pub volumes_created: AtomicU64,
    pub volumes_failed: AtomicU64,
    pub volumes_destroyed: AtomicU64,
    pub layers_imported: AtomicU64,
    pub requests_completed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_longer_1s: AtomicU64,
    pub requests_longer_3s: AtomicU64,
    pub requests_longer_30s: AtomicU64,
    pub requests_longer_5m: AtomicU64,
    pub clients_connected: AtomicU64,
    pub clients_rejected: AtomicU64,
    pub epoll_wakeups: AtomicU64,
    pub events_handled: AtomicU64,
    pub exit_events: AtomicU64,
    pub restore_errors: AtomicU64,
}

impl Statistics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Note a finished request for the long-request counters.
    pub fn note_request(&self, elapsed: std::time::Duration, ok: bool) {
        if ok {
            Self::bump(&self.requests_completed);
        } else {
            Self::bump(&self.requests_failed);
        }
        let secs = elapsed.as_secs();
        if secs >= 1 {
            Self::bump(&self.requests_longer_1s);
        }
        if secs >= 3 {
            Self::bump(&self.requests_longer_3s);
        }
        if secs >= 30 {
            Self::bump(&self.requests_longer_30s);
        }
        if secs >= 300 {
            Self::bump(&self.requests_longer_5m);
        }
    }

    /// Snapshot for the RPC system response and the diagnostics dump.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let mut map = HashMap::new();
        map.insert("containers_created".into(), read(&self.containers_created));
        map.insert("containers_started".into(), read(&self.containers_started));
        map.insert(
            "containers_failed_start".into(),
            read(&self.containers_failed_start),
        );
        map.insert("containers_oom".into(), read(&self.containers_oom));
        map.insert(
            "containers_respawned".into(),
            read(&self.containers_respawned),
        );
        map.insert(
            "containers_destroyed".into(),
            read(&self.containers_destroyed),
        );
        map.insert("volumes_created".into(), read(&self.volumes_created));
        map.insert("volumes_failed".into(), read(&self.volumes_failed));
        map.insert("volumes_destroyed".into(), read(&self.volumes_destroyed));
        map.insert("layers_imported".into(), read(&self.layers_imported));
        map.insert("requests_completed".into(), read(&self.requests_completed));
        map.insert("requests_failed".into(), read(&self.requests_failed));
        map.insert("requests_longer_1s".into(), read(&self.requests_longer_1s));
        map.insert("requests_longer_3s".into(), read(&self.requests_longer_3s));
        map.insert(
            "requests_longer_30s".into(),
            read(&self.requests_longer_30s),
        );
        map.insert("requests_longer_5m".into(), read(&self.requests_longer_5m));
        map.insert("clients_connected".into(), read(&self.clients_connected));
        map.insert("clients_rejected".into(), read(&self.clients_rejected));
        map.insert("epoll_wakeups".into(), read(&self.epoll_wakeups));
        map.insert("events_handled".into(), read(&self.events_handled));
        map.insert("exit_events".into(), read(&self.exit_events));
        map.insert("restore_errors".into(), read(&self.restore_errors));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_note_request_buckets() {
        let stats = Statistics::default();
        stats.note_request(Duration::from_millis(10), true);
        stats.note_request(Duration::from_secs(4), true);
        stats.note_request(Duration::from_secs(400), false);
        let snap = stats.snapshot();
        assert_eq!(snap["requests_completed"], 2);
        assert_eq!(snap["requests_failed"], 1);
        assert_eq!(snap["requests_longer_1s"], 2);
        assert_eq!(snap["requests_longer_3s"], 2);
        assert_eq!(snap["requests_longer_30s"], 1);
        assert_eq!(snap["requests_longer_5m"], 1);
    }
}
