//! The supervisor process and the engine entry point.
//!
//! A minimal parent forks the engine, re-forks it on crash, and owns
//! the exit-status plumbing: as the child subreaper it waits all
//! descendants and forwards `(pid, status)` pairs over the reap pipe.
//! Pairs stay queued until the engine acknowledges the pid over the ack
//! pipe, so no status is lost across an engine restart and no pid is
//! delivered twice.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use arbor_shared::{ArborError, ArborResult, ErrorKind};
use nix::sys::signal::Signal;
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use super::epoll::{EpollLoop, LoopExit, ACK_FD, LISTEN_FD, REAP_FD};
use super::Engine;
use crate::config::DaemonConfig;
use crate::util::proc::PidFile;

/// Options distilled from the command line.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub norespawn: bool,
    pub discard: bool,
}

/// One unacknowledged exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingExit {
    pid: u32,
    status: i32,
}

/// Queue of exit statuses awaiting engine acknowledgement.
///
/// Acked pids are dropped; everything else is replayed, in order, to a
/// freshly spawned engine.
#[derive(Debug, Default)]
pub struct ExitQueue {
    pending: VecDeque<PendingExit>,
}

impl ExitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pid: u32, status: i32) {
        // A pid can die only once per queue lifetime.
        if !self.pending.iter().any(|p| p.pid == pid) {
            self.pending.push_back(PendingExit { pid, status });
        }
    }

    pub fn ack(&mut self, pid: u32) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.pid != pid);
        before != self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (u32, i32)> + '_ {
        self.pending.iter().map(|p| (p.pid, p.status))
    }
}

fn sys(err: nix::errno::Errno, what: &str) -> ArborError {
    ArborError::with_errno(ErrorKind::Unknown, err as i32, format!("{}: {}", what, err))
}

fn write_exit(fd: &OwnedFd, pid: u32, status: i32) -> bool {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&pid.to_ne_bytes());
    buf[4..8].copy_from_slice(&status.to_ne_bytes());
    nix::unistd::write(fd, &buf).is_ok()
}

/// Bind the listening socket, or adopt the one inherited at the fixed
/// fd after a self-exec.
fn make_listener(config: &DaemonConfig) -> ArborResult<UnixListener> {
    if std::env::var_os("ARBORD_REEXEC").is_some() {
        // Safety: the fd was placed there by our own exec path.
        let listener = unsafe { UnixListener::from_raw_fd(LISTEN_FD) };
        std::env::remove_var("ARBORD_REEXEC");
        return Ok(listener);
    }
    let _ = std::fs::remove_file(&config.socket_path);
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ArborError::from(e).context("creating socket dir"))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .map_err(|e| ArborError::from(e).context("binding socket"))?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(
        &config.socket_path,
        std::fs::Permissions::from_mode(config.socket_mode),
    )
    .map_err(|e| ArborError::from(e).context("chmod socket"))?;
    if config.socket_group != 0 {
        let _ = nix::unistd::chown(
            &config.socket_path,
            None,
            Some(nix::unistd::Gid::from_raw(config.socket_group)),
        );
    }
    // Park the fd at its fixed number so re-exec keeps it.
    let raw = listener.as_raw_fd();
    if raw != LISTEN_FD {
        if unsafe { libc::dup2(raw, LISTEN_FD) } < 0 {
            return Err(ArborError::from(std::io::Error::last_os_error())
                .context("dup2 listen fd"));
        }
        // Keep CLOEXEC off so the fd survives the self-exec.
        unsafe { libc::fcntl(LISTEN_FD, libc::F_SETFD, 0) };
        drop(listener);
        return Ok(unsafe { UnixListener::from_raw_fd(LISTEN_FD) });
    }
    Ok(listener)
}

/// The engine process body: restore state, run the loop, exit or exec.
pub fn engine_main(
    config: DaemonConfig,
    reap_fd: Option<OwnedFd>,
    ack_fd: Option<OwnedFd>,
) -> ArborResult<i32> {
    let engine = Engine::new(config.clone())?;
    *engine.ack_fd.lock() = ack_fd;

    let engine_pidfile = PidFile::new(&config.engine_pidfile);
    let comm = crate::util::proc::read_comm(std::process::id()).unwrap_or_default();
    let _ = engine_pidfile.save(std::process::id(), &comm);

    engine.restore()?;
    let events_thread = engine.events.start_worker({
        let engine = Arc::clone(&engine);
        move |event| engine.handle_event(event)
    });
    let _sweeper = engine.start_layer_sweeper();

    let listener = make_listener(&config)?;
    let epoll_loop = EpollLoop::new(Arc::clone(&engine), listener, reap_fd)?;
    let exit = epoll_loop.run()?;

    engine.events.stop();
    let _ = events_thread.join();

    match exit {
        LoopExit::Shutdown => {
            if engine
                .discard_state
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                tracing::warn!("discarding persistent state");
                let _ = std::fs::remove_dir_all(&config.state_dir);
            }
            engine_pidfile.remove();
            Ok(0)
        }
        LoopExit::Reexec => {
            // Same binary, same fixed fds; the listen socket survives.
            std::env::set_var("ARBORD_REEXEC", "1");
            let exe = std::ffi::CString::new("/proc/self/exe")
                .expect("static string contains no NUL");
            let argv = [
                std::ffi::CString::new("arbord").expect("no NUL"),
                std::ffi::CString::new("daemon").expect("no NUL"),
            ];
            nix::unistd::execv(&exe, &argv).map_err(|e| sys(e, "execv"))?;
            unreachable!("execv returned");
        }
    }
}

/// The supervisor body: subreaper, engine respawn, exit forwarding.
pub fn run(config: DaemonConfig, options: DaemonOptions) -> ArborResult<i32> {
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        return Err(ArborError::from(std::io::Error::last_os_error())
            .context("PR_SET_CHILD_SUBREAPER"));
    }

    let pidfile = PidFile::new(&config.pidfile);
    let comm = crate::util::proc::read_comm(std::process::id()).unwrap_or_default();
    pidfile.save(std::process::id(), &comm)?;

    if options.discard {
        tracing::warn!("--discard: dropping persistent state before startup");
        let _ = std::fs::remove_dir_all(&config.state_dir);
    }

    let mut mask = SigSet::empty();
    for sig in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGCHLD,
    ] {
        mask.add(sig);
    }
    mask.thread_block().map_err(|e| sys(e, "blocking signals"))?;
    let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)
        .map_err(|e| sys(e, "supervisor signalfd"))?;

    let mut queue = ExitQueue::new();
    let mut shutdown = false;
    let mut exit_code = 0;

    'supervise: loop {
        // Fresh pipes per engine generation.
        let (reap_r, reap_w) = nix::unistd::pipe().map_err(|e| sys(e, "reap pipe"))?;
        let (ack_r, ack_w) = nix::unistd::pipe().map_err(|e| sys(e, "ack pipe"))?;
        set_nonblocking(&reap_r)?;
        set_nonblocking(&ack_r)?;

        let engine_pid = match unsafe { fork() }.map_err(|e| sys(e, "fork engine"))? {
            ForkResult::Child => {
                drop(signal_fd);
                let mut child_mask = SigSet::empty();
                child_mask.add(Signal::SIGINT);
                child_mask.add(Signal::SIGTERM);
                child_mask.add(Signal::SIGHUP);
                child_mask.add(Signal::SIGCHLD);
                let _ = child_mask.thread_unblock();
                drop(reap_w);
                drop(ack_r);
                // Park both pipe ends at their fixed numbers so a
                // SIGHUP self-exec keeps them.
                let reap_r = park_fd(reap_r, REAP_FD);
                let ack_w = park_fd(ack_w, ACK_FD);
                let code = match engine_main(config.clone(), reap_r, ack_w) {
                    Ok(code) => code,
                    Err(e) => {
                        tracing::error!(error = %e, "engine failed");
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                drop(reap_r);
                drop(ack_w);
                child
            }
        };
        tracing::info!(pid = engine_pid.as_raw(), "engine spawned");

        // Replay everything the previous engine never acknowledged.
        for (pid, status) in queue.iter() {
            let _ = write_exit(&reap_w, pid, status);
        }

        loop {
            let siginfo = match signal_fd.read_signal() {
                Ok(Some(siginfo)) => siginfo,
                Ok(None) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(sys(e, "supervisor signal read")),
            };
            let signo = Signal::try_from(siginfo.ssi_signo as i32).ok();
            match signo {
                Some(Signal::SIGINT) | Some(Signal::SIGTERM) => {
                    shutdown = true;
                    let forward = if signo == Some(Signal::SIGINT) {
                        Signal::SIGINT
                    } else {
                        Signal::SIGTERM
                    };
                    let _ = nix::sys::signal::kill(engine_pid, forward);
                }
                Some(Signal::SIGHUP) => {
                    let _ = nix::sys::signal::kill(engine_pid, Signal::SIGHUP);
                }
                Some(Signal::SIGCHLD) => {
                    drain_acks(&ack_r, &mut queue);
                    loop {
                        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                            Ok(WaitStatus::Exited(pid, code)) => {
                                if pid == engine_pid {
                                    exit_code = code;
                                    if handle_engine_exit(
                                        &options, shutdown, code, &mut queue,
                                    ) {
                                        break 'supervise;
                                    }
                                    continue 'supervise;
                                }
                                let status = code << 8;
                                queue.push(pid.as_raw() as u32, status);
                                let _ = write_exit(&reap_w, pid.as_raw() as u32, status);
                            }
                            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                                if pid == engine_pid {
                                    exit_code = 128 + sig as i32;
                                    if handle_engine_exit(
                                        &options,
                                        shutdown,
                                        exit_code,
                                        &mut queue,
                                    ) {
                                        break 'supervise;
                                    }
                                    continue 'supervise;
                                }
                                let status = sig as i32;
                                queue.push(pid.as_raw() as u32, status);
                                let _ = write_exit(&reap_w, pid.as_raw() as u32, status);
                            }
                            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                            Ok(_) => continue,
                            Err(nix::errno::Errno::EINTR) => continue,
                            Err(e) => return Err(sys(e, "supervisor waitpid")),
                        }
                    }
                }
                _ => {}
            }
            drain_acks(&ack_r, &mut queue);
        }
    }

    pidfile.remove();
    Ok(exit_code)
}

/// Returns true when the supervisor should stop instead of respawning.
fn handle_engine_exit(
    options: &DaemonOptions,
    shutdown: bool,
    code: i32,
    queue: &mut ExitQueue,
) -> bool {
    if shutdown {
        tracing::info!(code, "engine exited, supervisor shutting down");
        return true;
    }
    if options.norespawn {
        tracing::warn!(code, "engine exited, respawn disabled");
        return true;
    }
    tracing::warn!(
        code,
        pending = queue.len(),
        "engine died, respawning with the pending exit queue"
    );
    false
}

fn drain_acks(ack_r: &OwnedFd, queue: &mut ExitQueue) {
    let mut buf = [0u8; 4];
    loop {
        match nix::unistd::read(ack_r, &mut buf) {
            Ok(4) => {
                let pid = u32::from_ne_bytes(buf);
                if queue.ack(pid) {
                    tracing::debug!(pid, "exit acknowledged");
                }
            }
            Ok(_) => break,
            Err(nix::errno::Errno::EAGAIN) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// Move a descriptor to a fixed number with CLOEXEC off.
fn park_fd(fd: OwnedFd, fixed: RawFd) -> Option<OwnedFd> {
    let raw = fd.as_raw_fd();
    if raw == fixed {
        unsafe { libc::fcntl(fixed, libc::F_SETFD, 0) };
        return Some(fd);
    }
    if unsafe { libc::dup2(raw, fixed) } < 0 {
        tracing::error!(raw, fixed, "dup2 failed");
        return None;
    }
    unsafe { libc::fcntl(fixed, libc::F_SETFD, 0) };
    drop(fd);
    Some(unsafe { OwnedFd::from_raw_fd(fixed) })
}

/// Adopt a fixed-number descriptor after a self-exec.
fn adopt_fd(fixed: RawFd) -> Option<OwnedFd> {
    if unsafe { libc::fcntl(fixed, libc::F_GETFD) } < 0 {
        return None;
    }
    Some(unsafe { OwnedFd::from_raw_fd(fixed) })
}

/// Entry point of a re-exec'ed engine: the listen socket and both pipes
/// are waiting at their fixed descriptors.
pub fn engine_reentry(config: DaemonConfig) -> ArborResult<i32> {
    let reap = adopt_fd(REAP_FD);
    let ack = adopt_fd(ACK_FD);
    engine_main(config, reap, ack)
}

fn set_nonblocking(fd: &OwnedFd) -> ArborResult<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(|e| sys(e, "F_GETFL"))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags)).map_err(|e| sys(e, "F_SETFL"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_queue_ack_drops_pid() {
        let mut queue = ExitQueue::new();
        queue.push(100, 7 << 8);
        queue.push(101, 9);
        assert_eq!(queue.len(), 2);
        assert!(queue.ack(100));
        assert!(!queue.ack(100), "acked pid must not linger");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_exit_queue_dedups_pids() {
        let mut queue = ExitQueue::new();
        queue.push(100, 1);
        queue.push(100, 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next(), Some((100, 1)));
    }

    #[test]
    fn test_replay_preserves_unacked_only() {
        let mut queue = ExitQueue::new();
        queue.push(1, 11);
        queue.push(2, 22);
        queue.push(3, 33);
        queue.ack(2);
        let replay: Vec<(u32, i32)> = queue.iter().collect();
        assert_eq!(replay, vec![(1, 11), (3, 33)]);
    }
}
