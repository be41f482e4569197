//! Request worker pool.
//!
//! The I/O thread parses frames and enqueues one work item per client
//! at a time (per-client ordering); N workers pop the FIFO, run the
//! dispatcher and push the response back for the I/O thread to write.

use std::sync::Arc;

use arbor_shared::rpc::Response;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::client::ClientInfo;
use crate::daemon::Engine;

/// One parsed request bound for a worker.
pub struct WorkItem {
    pub info: ClientInfo,
    pub frame: Vec<u8>,
}

/// One finished response bound for the I/O thread.
pub struct Completion {
    pub fd: i32,
    pub response: Response,
}

pub struct WorkerPool {
    tx: Sender<WorkItem>,
    done_rx: Receiver<Completion>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers; every completion wakes the epoll loop.
    pub fn start(engine: &Arc<Engine>, count: usize) -> WorkerPool {
        let (tx, rx) = unbounded::<WorkItem>();
        let (done_tx, done_rx) = unbounded::<Completion>();
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let rx = rx.clone();
            let done_tx = done_tx.clone();
            let engine = Arc::clone(engine);
            let handle = std::thread::Builder::new()
                .name(format!("arbord-worker-{}", i))
                .spawn(move || {
                    while let Ok(item) = rx.recv() {
                        let response = crate::rpc::handle_frame(&engine, &item.info, &item.frame);
                        let fd = item.info.fd;
                        if done_tx.send(Completion { fd, response }).is_err() {
                            break;
                        }
                        engine.wake_loop();
                    }
                })
                .expect("spawning request worker");
            handles.push(handle);
        }
        WorkerPool {
            tx,
            done_rx,
            handles,
        }
    }

    pub fn submit(&self, item: WorkItem) {
        let _ = self.tx.send(item);
    }

    /// Drain finished responses without blocking.
    pub fn completions(&self) -> Vec<Completion> {
        let mut done = Vec::new();
        while let Ok(completion) = self.done_rx.try_recv() {
            done.push(completion);
        }
        done
    }

    /// Close the queue and join the workers.
    pub fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
