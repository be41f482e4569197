//! Due-time event queue.
//!
//! Events are ordered on a min-heap by due-time, ties broken by
//! insertion order. A dedicated worker thread sleeps on a condvar for
//! `max(0, top.due - now)` and hands due events to the engine's handler.
//! Scheduling an event in the past is legal; it fires immediately.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::container::CtId;
use crate::now_ms;

/// Enum-tagged daemon event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Main task of a container exited.
    Exit { pid: u32, status: i32 },
    /// Exit status forwarded by the supervisor over the reap pipe.
    ChildExit { pid: u32, status: i32 },
    Oom { ct: CtId },
    Respawn { ct: CtId },
    RotateLogs,
    WaitTimeout { waiter: u64 },
    DestroyAgedContainer { ct: CtId },
    DestroyWeakContainer { ct: CtId },
    NetworkWatchdog,
}

impl Event {
    /// Short tag for logs and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Exit { .. } => "exit",
            Event::ChildExit { .. } => "child_exit",
            Event::Oom { .. } => "oom",
            Event::Respawn { .. } => "respawn",
            Event::RotateLogs => "rotate_logs",
            Event::WaitTimeout { .. } => "wait_timeout",
            Event::DestroyAgedContainer { .. } => "destroy_aged",
            Event::DestroyWeakContainer { .. } => "destroy_weak",
            Event::NetworkWatchdog => "network_watchdog",
        }
    }
}

#[derive(Debug)]
struct QueuedEvent {
    due_ms: u64,
    seq: u64,
    event: Event,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest due
        // time (then the earliest insertion) on top.
        other
            .due_ms
            .cmp(&self.due_ms)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<QueuedEvent>,
    seq: u64,
    stopped: bool,
}

/// Shared priority-time queue.
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl EventQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Schedule `event` to fire `delay_ms` from now.
    pub fn add(&self, delay_ms: u64, event: Event) {
        let due_ms = now_ms().saturating_add(delay_ms);
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        tracing::debug!(kind = event.kind(), due_ms, "queued event");
        inner.heap.push(QueuedEvent { due_ms, seq, event });
        self.cond.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop every event due at `now`, in order. Test and drain helper.
    pub fn take_due(&self, now: u64) -> Vec<Event> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        while inner
            .heap
            .peek()
            .map(|top| top.due_ms <= now)
            .unwrap_or(false)
        {
            due.push(inner.heap.pop().expect("peeked").event);
        }
        due
    }

    /// Block until one event is due or the queue is stopped.
    pub fn next(&self) -> Option<Event> {
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            let now = now_ms();
            match inner.heap.peek() {
                Some(top) if top.due_ms <= now => {
                    return Some(inner.heap.pop().expect("peeked").event);
                }
                Some(top) => {
                    let wait = Duration::from_millis(top.due_ms - now);
                    self.cond.wait_for(&mut inner, wait);
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    /// Stop the worker loop; pending events are dropped.
    pub fn stop(&self) {
        self.inner.lock().stopped = true;
        self.cond.notify_all();
    }

    /// Spawn the worker thread feeding due events into `handler`.
    pub fn start_worker(
        self: &Arc<Self>,
        handler: impl Fn(Event) + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let queue = Arc::clone(self);
        std::thread::Builder::new()
            .name("arbord-events".to_string())
            .spawn(move || {
                while let Some(event) = queue.next() {
                    handler(event);
                }
            })
            .expect("spawning event worker")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_due_ordering_with_ties() {
        let queue = EventQueue::new();
        queue.add(50, Event::RotateLogs);
        queue.add(0, Event::Exit { pid: 1, status: 0 });
        queue.add(0, Event::Exit { pid: 2, status: 0 });

        let due = queue.take_due(now_ms());
        assert_eq!(
            due,
            vec![
                Event::Exit { pid: 1, status: 0 },
                Event::Exit { pid: 2, status: 0 },
            ]
        );
        // The delayed event is still queued.
        assert_eq!(queue.len(), 1);
        let later = queue.take_due(now_ms() + 60);
        assert_eq!(later, vec![Event::RotateLogs]);
    }

    #[test]
    fn test_past_due_fires_immediately() {
        let queue = EventQueue::new();
        queue.add(0, Event::NetworkWatchdog);
        let event = queue.next();
        assert_eq!(event, Some(Event::NetworkWatchdog));
    }

    #[test]
    fn test_worker_delivers_and_stops() {
        let queue = EventQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = queue.start_worker(move |_| {
            seen.fetch_add(1, AtomicOrdering::SeqCst);
        });

        queue.add(0, Event::RotateLogs);
        queue.add(1, Event::NetworkWatchdog);
        let start = std::time::Instant::now();
        while count.load(AtomicOrdering::SeqCst) < 2 && start.elapsed().as_secs() < 5 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);

        queue.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_drops_pending() {
        let queue = EventQueue::new();
        queue.add(10_000, Event::RotateLogs);
        queue.stop();
        assert_eq!(queue.next(), None);
    }
}
