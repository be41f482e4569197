//! Payload task launch.
//!
//! The child is set up between `fork()` and `exec()` in a pre-exec hook
//! restricted to async-signal-safe syscalls: no allocation, no locks,
//! no logging. Everything the hook needs (paths, cgroup files, cap bit
//! lists) is precomputed into plain buffers by the parent.
//!
//! With pid isolation the direct child unshares the pid namespace and
//! forks once more; the outer process stays behind as the wait-task the
//! reaper observes, forwarding the payload's exit status, while the
//! inner process becomes init of the namespace and execs the payload.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use arbor_shared::{ArborError, ArborResult};

use super::{Container, Ulimit, VirtMode};
use crate::net::NetMode;

/// One bind mount precomputed for the child.
#[derive(Debug)]
struct PreparedBind {
    source: CString,
    target: CString,
    read_only: bool,
}

/// Everything the pre-exec hook consumes.
pub struct TaskSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    chroot: Option<CString>,
    binds: Vec<PreparedBind>,
    cgroup_procs: Vec<CString>,
    hostname: Option<CString>,
    unshare_flags: libc::c_int,
    isolate_pids: bool,
    uid: u32,
    gid: u32,
    groups: Vec<libc::gid_t>,
    rlimits: Vec<(libc::c_int, u64, u64)>,
    drop_bounding: Vec<u8>,
    raise_ambient: Vec<u8>,
    oom_score_adj: i32,
    stdout: Option<File>,
    stderr: Option<File>,
}

/// Pids observed after a successful launch.
#[derive(Debug, Clone, Copy)]
pub struct SpawnedTask {
    /// The payload.
    pub task_pid: u32,
    /// The pid the reaper will see exit.
    pub wait_pid: u32,
}

/// Split a command line honoring single and double quotes.
pub fn split_command(command: &str) -> ArborResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();
    while let Some(ch) = chars.next() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else if ch == '\\' && q == '"' {
                    match chars.next() {
                        Some(escaped) => current.push(escaped),
                        None => return Err(ArborError::invalid_value("trailing backslash")),
                    }
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_word = true;
                    }
                    None => return Err(ArborError::invalid_value("trailing backslash")),
                },
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(ArborError::invalid_value(format!(
            "unterminated quote in command {:?}",
            command
        )));
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(ArborError::invalid_value("empty command"));
    }
    Ok(words)
}

fn rlimit_resource(name: &str) -> ArborResult<libc::c_int> {
    let resource = match name {
        "as" => libc::RLIMIT_AS,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "locks" => libc::RLIMIT_LOCKS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "msgqueue" => libc::RLIMIT_MSGQUEUE,
        "nice" => libc::RLIMIT_NICE,
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "rss" => libc::RLIMIT_RSS,
        "rtprio" => libc::RLIMIT_RTPRIO,
        "sigpending" => libc::RLIMIT_SIGPENDING,
        "stack" => libc::RLIMIT_STACK,
        other => {
            return Err(ArborError::invalid_value(format!(
                "unknown ulimit {:?}",
                other
            )))
        }
    };
    Ok(resource as libc::c_int)
}

fn c_path(path: &Path) -> ArborResult<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| ArborError::invalid_path("path contains NUL"))
}

impl TaskSpec {
    /// Precompute the launch plan from a container's configuration.
    ///
    /// `cgroup_procs` lists every `cgroup.procs` file the child joins.
    pub fn prepare(
        ct: &Container,
        cgroup_procs: Vec<PathBuf>,
        stdout: Option<File>,
        stderr: Option<File>,
    ) -> ArborResult<TaskSpec> {
        let argv = split_command(&ct.command)?;

        let mut env: Vec<(String, String)> = vec![
            (
                "PATH".into(),
                "/usr/sbin:/usr/bin:/sbin:/bin".into(),
            ),
            ("HOME".into(), ct.cwd.display().to_string()),
            (
                crate::CONTAINER_ENV_VAR.into(),
                crate::CONTAINER_ENV_VALUE.into(),
            ),
        ];
        for entry in &ct.env {
            if let Some((name, value)) = entry.split_once('=') {
                env.retain(|(existing, _)| existing != name);
                env.push((name.to_string(), value.to_string()));
            }
        }

        let root = ct.effective_root().to_path_buf();
        let in_chroot = ct.in_chroot();
        let mut unshare_flags = 0;
        if in_chroot || !ct.bind_mounts.is_empty() {
            unshare_flags |= libc::CLONE_NEWNS;
        }
        if ct.hostname.is_some() {
            unshare_flags |= libc::CLONE_NEWUTS;
        }
        if ct.net == NetMode::None {
            unshare_flags |= libc::CLONE_NEWNET;
        }
        if ct.virt_mode == VirtMode::Os {
            unshare_flags |= libc::CLONE_NEWIPC;
        }

        let mut binds = Vec::new();
        for bind in &ct.bind_mounts {
            let target = if in_chroot {
                root.join(bind.target.strip_prefix("/").unwrap_or(&bind.target))
            } else {
                bind.target.clone()
            };
            binds.push(PreparedBind {
                source: c_path(&bind.source)?,
                target: c_path(&target)?,
                read_only: bind.read_only,
            });
        }

        let mut rlimits = Vec::new();
        for Ulimit { name, soft, hard } in &ct.ulimits {
            rlimits.push((rlimit_resource(name)?, *soft, *hard));
        }

        // Bounding caps outside `cap_bound` are dropped one by one;
        // ambient caps are raised after the uid switch.
        let all = super::capabilities::CapSet::all_known();
        let drop_bounding = all
            .subtract(&ct.cap_bound)
            .iter()
            .map(|cap| cap.index())
            .collect();
        let raise_ambient = ct.cap_ambient.iter().map(|cap| cap.index()).collect();

        Ok(TaskSpec {
            argv,
            env,
            cwd: ct.cwd.clone(),
            chroot: if in_chroot {
                Some(c_path(&root)?)
            } else {
                None
            },
            binds,
            cgroup_procs: cgroup_procs
                .iter()
                .map(|p| c_path(p))
                .collect::<ArborResult<_>>()?,
            hostname: ct
                .hostname
                .as_ref()
                .map(|h| CString::new(h.as_bytes()))
                .transpose()
                .map_err(|_| ArborError::invalid_value("hostname contains NUL"))?,
            unshare_flags,
            isolate_pids: ct.isolate,
            uid: ct.task_cred.uid,
            gid: ct.task_cred.gid,
            groups: ct.task_cred.groups.iter().map(|g| *g as libc::gid_t).collect(),
            rlimits,
            drop_bounding,
            raise_ambient,
            oom_score_adj: ct.oom_score_adj,
            stdout,
            stderr,
        })
    }

    /// Fork and exec the payload.
    pub fn spawn(self) -> ArborResult<SpawnedTask> {
        use std::os::unix::process::CommandExt;

        let mut command = Command::new(&self.argv[0]);
        command.args(&self.argv[1..]);
        command.env_clear();
        for (name, value) in &self.env {
            command.env(name, value);
        }
        command.stdin(Stdio::null());
        match self.stdout {
            Some(file) => command.stdout(file),
            None => command.stdout(Stdio::null()),
        };
        match self.stderr {
            Some(file) => command.stderr(file),
            None => command.stderr(Stdio::null()),
        };
        // cwd is entered by the hook after the chroot.

        // Pipe over which the isolated shim reports the payload pid.
        let (pipe_r, pipe_w) = nix::unistd::pipe().map_err(|e| {
            ArborError::with_errno(
                arbor_shared::ErrorKind::Unknown,
                e as i32,
                format!("pipe: {}", e),
            )
        })?;
        let pipe_w_fd = pipe_w.as_raw_fd();

        let chroot = self.chroot;
        let binds = self.binds;
        let cgroup_procs = self.cgroup_procs;
        let hostname = self.hostname;
        let unshare_flags = self.unshare_flags;
        let isolate = self.isolate_pids;
        let (uid, gid) = (self.uid, self.gid);
        let groups = self.groups;
        let rlimits = self.rlimits;
        let drop_bounding = self.drop_bounding;
        let raise_ambient = self.raise_ambient;
        let oom_score_adj = self.oom_score_adj;
        let cwd = c_path(&self.cwd)?;

        // SAFETY: the hook only calls async-signal-safe syscalls on
        // buffers precomputed above; no allocation, locks or logging.
        unsafe {
            command.pre_exec(move || {
                child_setup(
                    &cgroup_procs,
                    unshare_flags,
                    isolate,
                    pipe_w_fd,
                    &binds,
                    chroot.as_deref(),
                    &cwd,
                    hostname.as_deref(),
                    &rlimits,
                    &drop_bounding,
                    &raise_ambient,
                    uid,
                    gid,
                    &groups,
                    oom_score_adj,
                )
            });
        }

        let child = command
            .spawn()
            .map_err(|e| ArborError::from(e).context(format!("executing {:?}", self.argv[0])))?;
        drop(pipe_w);
        let wait_pid = child.id();
        // The harness reaper owns the exit status; forget the handle so
        // std never wait()s behind its back.
        std::mem::forget(child);

        let task_pid = if isolate {
            let mut buf = [0u8; 4];
            let mut filled = 0;
            let pipe_r: OwnedFd = pipe_r;
            while filled < buf.len() {
                match nix::unistd::read(&pipe_r, &mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(ArborError::with_errno(
                            arbor_shared::ErrorKind::Unknown,
                            e as i32,
                            "reading payload pid".to_string(),
                        ))
                    }
                }
            }
            if filled < buf.len() {
                return Err(ArborError::invalid_state(
                    "task shim died before reporting the payload pid",
                ));
            }
            u32::from_ne_bytes(buf)
        } else {
            wait_pid
        };

        Ok(SpawnedTask { task_pid, wait_pid })
    }
}

/// The pre-exec body. Only async-signal-safe syscalls.
#[allow(clippy::too_many_arguments)]
fn child_setup(
    cgroup_procs: &[CString],
    unshare_flags: libc::c_int,
    isolate: bool,
    pipe_w: libc::c_int,
    binds: &[PreparedBind],
    chroot: Option<&std::ffi::CStr>,
    cwd: &std::ffi::CStr,
    hostname: Option<&std::ffi::CStr>,
    rlimits: &[(libc::c_int, u64, u64)],
    drop_bounding: &[u8],
    raise_ambient: &[u8],
    uid: u32,
    gid: u32,
    groups: &[libc::gid_t],
    oom_score_adj: i32,
) -> std::io::Result<()> {
    unsafe {
        if libc::setsid() < 0 {
            return Err(std::io::Error::last_os_error());
        }

        // 1. Join every cgroup before anything can fork.
        let mut pid_buf = [0u8; 16];
        let pid_len = format_dec(libc::getpid() as u64, &mut pid_buf);
        for procs in cgroup_procs {
            let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
            if fd < 0 {
                return Err(std::io::Error::last_os_error());
            }
            let written = libc::write(fd, pid_buf.as_ptr() as *const libc::c_void, pid_len);
            libc::close(fd);
            if written < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        // 2. oom_score_adj.
        if oom_score_adj != 0 {
            let fd = libc::open(
                c"/proc/self/oom_score_adj".as_ptr(),
                libc::O_WRONLY | libc::O_CLOEXEC,
            );
            if fd >= 0 {
                let mut buf = [0u8; 16];
                let len = format_signed(oom_score_adj as i64, &mut buf);
                libc::write(fd, buf.as_ptr() as *const libc::c_void, len);
                libc::close(fd);
            }
        }

        // 3. New namespaces.
        if unshare_flags != 0 && libc::unshare(unshare_flags) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if let Some(hostname) = hostname {
            if libc::sethostname(hostname.as_ptr(), hostname.to_bytes().len()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        // 4. Pid isolation: the current process becomes the wait-task,
        // a fresh fork becomes init of the new namespace.
        if isolate {
            if libc::unshare(libc::CLONE_NEWPID) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let inner = libc::fork();
            if inner < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if inner > 0 {
                // Wait-task: report the payload pid, forward its exit.
                let pid_bytes = (inner as u32).to_ne_bytes();
                libc::write(
                    pipe_w,
                    pid_bytes.as_ptr() as *const libc::c_void,
                    pid_bytes.len(),
                );
                libc::close(pipe_w);
                let mut status: libc::c_int = 0;
                loop {
                    let reaped = libc::waitpid(inner, &mut status, 0);
                    if reaped == inner || (reaped < 0 && *libc::__errno_location() != libc::EINTR)
                    {
                        break;
                    }
                }
                if libc::WIFSIGNALED(status) {
                    let sig = libc::WTERMSIG(status);
                    libc::signal(sig, libc::SIG_DFL);
                    libc::raise(sig);
                    libc::_exit(128 + sig);
                }
                libc::_exit(libc::WEXITSTATUS(status));
            }
            // Payload side continues below as pid 1.
        }
        libc::close(pipe_w);

        // 5. Bind mounts inside the fresh mount namespace.
        if unshare_flags & libc::CLONE_NEWNS != 0 {
            // Stop propagating into the host.
            if libc::mount(
                std::ptr::null(),
                c"/".as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_SLAVE,
                std::ptr::null(),
            ) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
        }
        for bind in binds {
            if libc::mount(
                bind.source.as_ptr(),
                bind.target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND,
                std::ptr::null(),
            ) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
            if bind.read_only
                && libc::mount(
                    std::ptr::null(),
                    bind.target.as_ptr(),
                    std::ptr::null(),
                    libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY,
                    std::ptr::null(),
                ) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
        }

        // 6. Enter the root.
        if let Some(root) = chroot {
            if libc::chroot(root.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if libc::chdir(cwd.as_ptr()) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        // 7. Resource limits.
        for (resource, soft, hard) in rlimits {
            let limit = libc::rlimit {
                rlim_cur: if *soft == u64::MAX {
                    libc::RLIM_INFINITY
                } else {
                    *soft as libc::rlim_t
                },
                rlim_max: if *hard == u64::MAX {
                    libc::RLIM_INFINITY
                } else {
                    *hard as libc::rlim_t
                },
            };
            if libc::setrlimit(*resource as libc::__rlimit_resource_t, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        // 8. Capabilities: shrink the bounding set, keep caps across
        // the uid switch only long enough to raise the ambient ones.
        for cap in drop_bounding {
            libc::prctl(libc::PR_CAPBSET_DROP, *cap as libc::c_ulong, 0, 0, 0);
        }
        let keep_caps = !raise_ambient.is_empty();
        if keep_caps {
            libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0);
        }

        // 9. Switch identity.
        if libc::setgroups(groups.len(), groups.as_ptr()) != 0 && !groups.is_empty() {
            return Err(std::io::Error::last_os_error());
        }
        if libc::setgid(gid) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::setuid(uid) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        for cap in raise_ambient {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                *cap as libc::c_ulong,
                0,
                0,
            );
        }
        if keep_caps {
            libc::prctl(libc::PR_SET_KEEPCAPS, 0, 0, 0, 0);
        }
    }
    Ok(())
}

/// Decimal formatting without allocation.
fn format_dec(mut value: u64, buf: &mut [u8; 16]) -> usize {
    let mut digits = [0u8; 20];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (value % 10) as u8;
        value /= 10;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in 0..n {
        buf[i] = digits[n - 1 - i];
    }
    n
}

fn format_signed(value: i64, buf: &mut [u8; 16]) -> usize {
    if value < 0 {
        buf[0] = b'-';
        let mut tail = [0u8; 16];
        let n = format_dec(value.unsigned_abs(), &mut tail);
        buf[1..1 + n].copy_from_slice(&tail[..n]);
        n + 1
    } else {
        format_dec(value as u64, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("sh -c 'exit 7'").unwrap(),
            vec!["sh", "-c", "exit 7"]
        );
        assert_eq!(
            split_command("echo \"a b\" c").unwrap(),
            vec!["echo", "a b", "c"]
        );
        assert_eq!(
            split_command("printf %s\\n hi").unwrap(),
            vec!["printf", "%sn", "hi"]
        );
        assert!(split_command("").is_err());
        assert!(split_command("echo 'unterminated").is_err());
    }

    #[test]
    fn test_rlimit_names() {
        assert!(rlimit_resource("nofile").is_ok());
        assert!(rlimit_resource("nproc").is_ok());
        assert!(rlimit_resource("bogus").is_err());
    }

    #[test]
    fn test_format_dec() {
        let mut buf = [0u8; 16];
        let n = format_dec(0, &mut buf);
        assert_eq!(&buf[..n], b"0");
        let n = format_dec(65535, &mut buf);
        assert_eq!(&buf[..n], b"65535");
        let n = format_signed(-300, &mut buf);
        assert_eq!(&buf[..n], b"-300");
    }
}
