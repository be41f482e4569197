//! External helper processes.
//!
//! mkfs, resize2fs, tar, lvm, rbd and squashfs tooling run as child
//! processes with piped stdio, their own session, optionally confined to
//! a helper cgroup, and bounded by a caller deadline. On expiry the
//! whole helper process group is SIGKILLed.

use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use arbor_shared::{ArborError, ArborResult};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::cgroup::Cgroup;

/// Default budget for helpers whose caller gives none.
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// One helper invocation.
pub struct Helper {
    command: Command,
    program: String,
    deadline: Instant,
    cgroup: Option<Cgroup>,
}

impl Helper {
    pub fn new(program: &str) -> Self {
        let mut command = Command::new(program);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Self {
            command,
            program: program.to_string(),
            deadline: Instant::now() + DEFAULT_HELPER_TIMEOUT,
            cgroup: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.command.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    /// Confine the helper to a cgroup (the daemon's helper cgroup).
    pub fn cgroup(mut self, cgroup: Cgroup) -> Self {
        self.cgroup = Some(cgroup);
        self
    }

    /// Run to completion; returns captured stdout on exit code 0.
    pub fn run(mut self) -> ArborResult<String> {
        use std::os::unix::process::CommandExt;

        let cgroup_procs = self.cgroup.as_ref().map(|cg| {
            std::ffi::CString::new(cg.path.join("cgroup.procs").to_string_lossy().into_owned())
                .expect("cgroup paths contain no NUL")
        });

        // Own session so deadline expiry can kill the whole group.
        unsafe {
            self.command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(ref procs) = cgroup_procs {
                    let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
                    if fd >= 0 {
                        let mut buf = [0u8; 16];
                        let pid = libc::getpid();
                        let len = format_pid(pid as u32, &mut buf);
                        libc::write(fd, buf.as_ptr() as *const libc::c_void, len);
                        libc::close(fd);
                    }
                }
                Ok(())
            });
        }

        let mut child = self.command.spawn().map_err(|e| {
            ArborError::from(e).context(format!("spawning helper {}", self.program))
        })?;
        let pid = child.id();
        tracing::debug!(helper = %self.program, pid, "helper started");

        // Whatever path we leave on, never leak a running helper group.
        let mut reaper = scopeguard::guard(child, |mut child| {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            let _ = child.wait();
        });

        let stdout = reaper.stdout.take().expect("stdout was piped");
        let stderr = reaper.stderr.take().expect("stderr was piped");
        let out_thread = std::thread::spawn(move || read_all(stdout));
        let err_thread = std::thread::spawn(move || read_all(stderr));

        let status = loop {
            match reaper.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= self.deadline {
                        tracing::warn!(helper = %self.program, pid, "helper deadline expired");
                        drop(reaper);
                        let _ = out_thread.join();
                        let _ = err_thread.join();
                        return Err(ArborError::busy(format!(
                            "helper {} killed after deadline",
                            self.program
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    return Err(ArborError::from(e).context(format!("waiting for {}", self.program)))
                }
            }
        };
        // Exited on its own; nothing left to reap.
        let _ = scopeguard::ScopeGuard::into_inner(reaper);

        let stdout = out_thread.join().unwrap_or_default();
        let stderr = err_thread.join().unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            Err(ArborError::unknown(format!(
                "helper {} failed ({}): {}",
                self.program,
                status,
                stderr.trim()
            )))
        }
    }
}

fn read_all(mut source: impl Read) -> String {
    let mut buf = String::new();
    let _ = source.read_to_string(&mut buf);
    buf
}

/// Decimal-format a pid into `buf` without allocating (pre_exec safe).
fn format_pid(mut pid: u32, buf: &mut [u8; 16]) -> usize {
    let mut digits = [0u8; 10];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (pid % 10) as u8;
        pid /= 10;
        n += 1;
        if pid == 0 {
            break;
        }
    }
    for i in 0..n {
        buf[i] = digits[n - 1 - i];
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_captures_stdout() {
        let out = Helper::new("/bin/echo").arg("hello").run().unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_helper_failure_carries_stderr() {
        let err = Helper::new("/bin/sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        assert!(err.message.contains("boom"), "got {:?}", err.message);
    }

    #[test]
    fn test_helper_deadline_kills() {
        let start = Instant::now();
        let err = Helper::new("/bin/sleep")
            .arg("30")
            .deadline(Instant::now() + Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::Busy);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_format_pid() {
        let mut buf = [0u8; 16];
        let len = format_pid(40961, &mut buf);
        assert_eq!(&buf[..len], b"40961");
        let len = format_pid(0, &mut buf);
        assert_eq!(&buf[..len], b"0");
    }
}
