//! The engine's epoll loop.
//!
//! One thread multiplexes: the listening socket, every client fd, a
//! signalfd (INT/TERM/HUP/USR1/USR2/CHLD), the reap-event pipe from the
//! supervisor, one OOM eventfd per running container, and a wake
//! eventfd stirred by workers and the event queue. The loop never
//! mutates containers itself; everything lands in the event queue or
//! the worker pool.

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use arbor_shared::{rpc, ArborError, ArborResult, ErrorKind};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::Signal;
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};

use super::workers::{WorkItem, WorkerPool};
use super::Engine;
use crate::client::Client;
use crate::events::Event;
use crate::stats::Statistics;

/// Fixed descriptor numbers surviving the engine's self-exec.
pub const LISTEN_FD: RawFd = 3;
pub const REAP_FD: RawFd = 4;
pub const ACK_FD: RawFd = 5;

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    /// SIGHUP: re-exec the binary, keeping the fixed fds.
    Reexec,
}

pub struct EpollLoop {
    engine: Arc<Engine>,
    epoll: Epoll,
    listener: UnixListener,
    signal_fd: SignalFd,
    reap_fd: Option<OwnedFd>,
    wake: Arc<nix::sys::eventfd::EventFd>,
    pool: WorkerPool,
    clients: HashMap<RawFd, Client>,
    oom_registered: HashSet<RawFd>,
}

impl EpollLoop {
    pub fn new(
        engine: Arc<Engine>,
        listener: UnixListener,
        reap_fd: Option<OwnedFd>,
    ) -> ArborResult<EpollLoop> {
        listener
            .set_nonblocking(true)
            .map_err(|e| ArborError::from(e).context("listener nonblocking"))?;

        let mut mask = SigSet::empty();
        for sig in [
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
            Signal::SIGCHLD,
        ] {
            mask.add(sig);
        }
        mask.thread_block()
            .map_err(|e| sys(e, "blocking signals"))?;
        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| sys(e, "signalfd"))?;

        let wake = Arc::new(
            nix::sys::eventfd::EventFd::from_flags(
                nix::sys::eventfd::EfdFlags::EFD_NONBLOCK
                    | nix::sys::eventfd::EfdFlags::EFD_CLOEXEC,
            )
            .map_err(|e| sys(e, "wake eventfd"))?,
        );
        *engine.wake.lock() = Some(Arc::clone(&wake));

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| sys(e, "epoll"))?;
        epoll
            .add(
                &listener,
                EpollEvent::new(EpollFlags::EPOLLIN, LISTEN_FD as u64),
            )
            .map_err(|e| sys(e, "epoll add listener"))?;
        epoll
            .add(
                &signal_fd,
                EpollEvent::new(EpollFlags::EPOLLIN, signal_fd.as_raw_fd() as u64),
            )
            .map_err(|e| sys(e, "epoll add signalfd"))?;
        if let Some(reap) = &reap_fd {
            epoll
                .add(reap, EpollEvent::new(EpollFlags::EPOLLIN, REAP_FD as u64))
                .map_err(|e| sys(e, "epoll add reap fd"))?;
        }
        epoll
            .add(
                wake.as_fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, wake.as_raw_fd() as u64),
            )
            .map_err(|e| sys(e, "epoll add wake"))?;

        let pool = WorkerPool::start(&engine, engine.config.workers);
        Ok(EpollLoop {
            engine,
            epoll,
            listener,
            signal_fd,
            reap_fd,
            wake,
            pool,
            clients: HashMap::new(),
            oom_registered: HashSet::new(),
        })
    }

    pub fn run(mut self) -> ArborResult<LoopExit> {
        let mut events = [EpollEvent::empty(); 64];
        loop {
            self.sync_oom_sources();
            let count = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(count) => count,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(sys(e, "epoll wait")),
            };
            Statistics::bump(&self.engine.stats.epoll_wakeups);

            for event in events.iter().take(count) {
                let data = event.data() as RawFd;
                if data == LISTEN_FD {
                    self.accept_clients();
                } else if data == self.signal_fd.as_raw_fd() {
                    if let Some(exit) = self.drain_signals()? {
                        self.pool.shutdown();
                        return Ok(exit);
                    }
                } else if data == REAP_FD {
                    self.drain_reap_pipe();
                } else if data == self.wake.as_raw_fd() {
                    let _ = self.wake.read();
                    self.drain_completions();
                    self.drain_fires();
                } else if self.oom_registered.contains(&data) {
                    self.handle_oom_fd(data);
                } else if self.clients.contains_key(&data) {
                    self.handle_client(data, event.events());
                }
            }
            // Completions may have landed while we were busy.
            self.drain_completions();
            self.drain_fires();
        }
    }

    // -----------------------------------------------------------------
    // clients

    fn accept_clients(&mut self) {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            };
            if self.clients.len() >= self.engine.config.max_clients && !self.evict_idle_client() {
                Statistics::bump(&self.engine.stats.clients_rejected);
                tracing::warn!("client limit reached, rejecting connection");
                continue;
            }
            match Client::identify(&self.engine, stream) {
                Ok(client) => {
                    let per_ct = self
                        .clients
                        .values()
                        .filter(|c| c.ct == client.ct)
                        .count();
                    if per_ct >= self.engine.config.max_clients_per_container {
                        Statistics::bump(&self.engine.stats.clients_rejected);
                        continue;
                    }
                    let fd = client.fd();
                    if let Err(e) = self
                        .epoll
                        .add(&client.stream, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
                    {
                        tracing::warn!(error = %e, "epoll add client failed");
                        continue;
                    }
                    Statistics::bump(&self.engine.stats.clients_connected);
                    self.clients.insert(fd, client);
                }
                Err(e) => {
                    Statistics::bump(&self.engine.stats.clients_rejected);
                    tracing::debug!(error = %e, "client rejected");
                }
            }
        }
    }

    /// Drop the longest-idle client with nothing in flight.
    fn evict_idle_client(&mut self) -> bool {
        let victim = self
            .clients
            .values()
            .filter(|c| !c.in_flight && c.write_buf.is_empty())
            .min_by_key(|c| c.last_activity_ms)
            .map(|c| c.fd());
        match victim {
            Some(fd) => {
                tracing::debug!(fd, "evicting idle client");
                self.drop_client(fd);
                true
            }
            None => false,
        }
    }

    fn drop_client(&mut self, fd: RawFd) {
        if let Some(client) = self.clients.remove(&fd) {
            let _ = self.epoll.delete(&client.stream);
            self.engine.client_disconnected(fd);
        }
    }

    fn handle_client(&mut self, fd: RawFd, flags: EpollFlags) {
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            self.drop_client(fd);
            return;
        }
        if flags.contains(EpollFlags::EPOLLIN) {
            let frames = {
                let Some(client) = self.clients.get_mut(&fd) else { return };
                match client.read_ready() {
                    Ok(Some(frames)) => frames,
                    Ok(None) => {
                        self.drop_client(fd);
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(fd, error = %e, "dropping client");
                        self.drop_client(fd);
                        return;
                    }
                }
            };
            if let Some(client) = self.clients.get_mut(&fd) {
                client.pending_frames.extend(frames);
            }
            self.pump_client(fd);
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            self.flush_client(fd);
        }
    }

    /// Submit the next pending frame unless one is already in flight.
    fn pump_client(&mut self, fd: RawFd) {
        let Some(client) = self.clients.get_mut(&fd) else { return };
        if client.in_flight {
            return;
        }
        let Some(frame) = client.pending_frames.pop_front() else {
            return;
        };
        client.in_flight = true;
        let info = client.info();
        self.pool.submit(WorkItem { info, frame });
    }

    fn drain_completions(&mut self) {
        for completion in self.pool.completions() {
            let queued = ErrorKind::from_code(completion.response.error) == ErrorKind::Queued;
            if let Some(client) = self.clients.get_mut(&completion.fd) {
                client.in_flight = false;
                client.queue_response(&completion.response);
                if queued {
                    tracing::trace!(fd = completion.fd, "request queued for later completion");
                }
            }
            self.pump_client(completion.fd);
            self.flush_client(completion.fd);
        }
    }

    fn drain_fires(&mut self) {
        let fires = std::mem::take(&mut *self.engine.pending_fires.lock());
        for fire in fires {
            let Some(client) = self.clients.get_mut(&fire.client_fd) else {
                continue;
            };
            let name = if fire.name.is_empty() {
                String::new()
            } else {
                match client.compose_name(&fire.name) {
                    Some(name) => name,
                    // Outside the client's namespace.
                    None => continue,
                }
            };
            let response = rpc::Response::with_body(rpc::response::Body::Wait(rpc::WaitResponse {
                name,
                state: fire.state,
                when_ms: fire.when_ms,
            }));
            client.queue_response(&response);
            self.flush_client(fire.client_fd);
        }
    }

    /// Write what we can; arm or disarm EPOLLOUT as needed.
    fn flush_client(&mut self, fd: RawFd) {
        let Some(client) = self.clients.get_mut(&fd) else { return };
        match client.write_ready() {
            Ok(needs_out) => {
                let mut flags = EpollFlags::EPOLLIN;
                if needs_out {
                    flags |= EpollFlags::EPOLLOUT;
                }
                let mut event = EpollEvent::new(flags, fd as u64);
                let _ = self.epoll.modify(&client.stream, &mut event);
            }
            Err(e) => {
                tracing::debug!(fd, error = %e, "write failed, dropping client");
                self.drop_client(fd);
            }
        }
    }

    // -----------------------------------------------------------------
    // signals, reap pipe, oom

    /// Returns `Some` when the loop must exit.
    fn drain_signals(&mut self) -> ArborResult<Option<LoopExit>> {
        while let Ok(Some(siginfo)) = self.signal_fd.read_signal() {
            let signo = Signal::try_from(siginfo.ssi_signo as i32)
                .map_err(|e| sys(e, "bad signal number"))?;
            match signo {
                Signal::SIGINT => {
                    tracing::info!("SIGINT: shutting down, discarding state");
                    self.engine
                        .discard_state
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                    return Ok(Some(LoopExit::Shutdown));
                }
                Signal::SIGTERM => {
                    tracing::info!("SIGTERM: shutting down");
                    return Ok(Some(LoopExit::Shutdown));
                }
                Signal::SIGHUP => {
                    tracing::info!("SIGHUP: re-executing");
                    return Ok(Some(LoopExit::Reexec));
                }
                Signal::SIGUSR1 => {
                    // The file writer reopens on its next write; just
                    // mark the spot in the stream.
                    tracing::info!("SIGUSR1: log reopen requested");
                }
                Signal::SIGUSR2 => {
                    let stats = self.engine.stats.snapshot();
                    tracing::info!(?stats, containers = self.engine.map.len(), "diagnostics dump");
                }
                Signal::SIGCHLD => self.reap_direct_children(),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Wait our own wait-task children; orphans are the supervisor's
    /// business and arrive over the reap pipe instead.
    fn reap_direct_children(&mut self) {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        let wait_pids: Vec<u32> = {
            let inner = self.engine.map.inner.lock();
            inner
                .subtree(self.engine.map.root)
                .into_iter()
                .filter_map(|id| inner.get(id).ok())
                .filter(|ct| ct.wait_task_pid != 0)
                .map(|ct| ct.wait_task_pid)
                .collect()
        };
        for pid in wait_pids {
            match waitpid(
                nix::unistd::Pid::from_raw(pid as i32),
                Some(WaitPidFlag::WNOHANG),
            ) {
                Ok(WaitStatus::Exited(reaped, code)) => {
                    self.engine.events.add(
                        0,
                        Event::Exit {
                            pid: reaped.as_raw() as u32,
                            status: code << 8,
                        },
                    );
                }
                Ok(WaitStatus::Signaled(reaped, sig, _)) => {
                    self.engine.events.add(
                        0,
                        Event::Exit {
                            pid: reaped.as_raw() as u32,
                            status: sig as i32,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    /// `(pid, status)` pairs forwarded by the supervisor.
    fn drain_reap_pipe(&mut self) {
        let Some(reap) = &self.reap_fd else { return };
        let mut buf = [0u8; 8];
        loop {
            match nix::unistd::read(reap, &mut buf) {
                Ok(8) => {
                    let pid = u32::from_ne_bytes(buf[0..4].try_into().expect("4 bytes"));
                    let status = i32::from_ne_bytes(buf[4..8].try_into().expect("4 bytes"));
                    self.engine.events.add(0, Event::ChildExit { pid, status });
                }
                Ok(_) => break,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "reap pipe read failed");
                    break;
                }
            }
        }
    }

    /// Register newly armed OOM eventfds, drop stale ones.
    fn sync_oom_sources(&mut self) {
        let current: HashSet<RawFd> = self.engine.oom_sources.lock().keys().copied().collect();
        for fd in current.difference(&self.oom_registered.clone()) {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(*fd) };
            match self
                .epoll
                .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, *fd as u64))
            {
                Ok(()) => {
                    self.oom_registered.insert(*fd);
                }
                Err(e) => tracing::warn!(fd, error = %e, "epoll add oom fd failed"),
            }
        }
        for fd in self.oom_registered.clone().difference(&current) {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(*fd) };
            let _ = self.epoll.delete(borrowed);
            self.oom_registered.remove(fd);
        }
    }

    /// One 64-bit counter per notification, never blocking.
    fn handle_oom_fd(&mut self, fd: RawFd) {
        let ct = self.engine.oom_sources.lock().get(&fd).copied();
        let Some(ct) = ct else { return };
        let mut buf = [0u8; 8];
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        match nix::unistd::read(&borrowed, &mut buf) {
            Ok(8) => {
                tracing::warn!("oom notification");
                self.engine.events.add(0, Event::Oom { ct });
            }
            _ => {
                // Container is tearing down; the fd will be dropped by
                // the next sync.
            }
        }
    }
}

fn sys(err: nix::errno::Errno, what: &str) -> ArborError {
    ArborError::with_errno(ErrorKind::Unknown, err as i32, format!("{}: {}", what, err))
}
