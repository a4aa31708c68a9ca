//! Child process creation. `std::process::Command` cannot attach namespace
//! flags or a target cgroup in the syscall that creates the child, so the
//! launcher drives `clone3(2)` directly: the requested namespaces, the
//! cgroup descriptor, and the process-group change all bind before any
//! user code runs.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use libc::c_char;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{pipe2, Pid};

use crate::error::{Error, Result};

/// clone3-only flag: place the child into the cgroup referred to by
/// `CloneArgs::cgroup` at creation time. libc does not define it.
const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

/// `struct clone_args` from linux/sched.h, CLONE_ARGS_SIZE_VER2.
#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Attributes applied in the clone that creates the child.
#[derive(Debug, Default)]
pub struct SpawnSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub new_pid_ns: bool,
    pub new_net_ns: bool,
    /// Root directory for the child; also unshares the mount namespace.
    pub chroot: Option<&'a Path>,
    /// Open descriptor on a cgroup v2 directory the child is spawned into.
    pub cgroup_fd: Option<RawFd>,
}

/// A successfully created child: the handle to wait on and signal, plus
/// the readable ends of its stdout and stderr pipes.
pub struct Spawned {
    pub handle: ChildHandle,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// How the child exited. `error` is empty for a clean zero exit.
#[derive(Clone, Debug)]
pub struct ExitOutcome {
    pub code: i32,
    pub error: String,
}

impl ExitOutcome {
    fn exited(code: i32) -> Self {
        let error = if code == 0 {
            String::new()
        } else {
            format!("exit status: {code}")
        };
        ExitOutcome { code, error }
    }

    fn signaled(signal: Signal) -> Self {
        ExitOutcome {
            code: -1,
            error: format!("terminated by signal: {signal}"),
        }
    }
}

#[derive(Clone)]
pub struct ChildHandle {
    pid: Pid,
}

impl ChildHandle {
    /// The child's process group id (the child is its own group leader).
    pub fn pgid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Delivers `signal` to the whole process group, so descendants the
    /// command spawned receive it too. A group that is already gone is not
    /// an error; the wait loop observes the exit either way.
    pub fn signal_group(&self, signal: Signal) -> Result<()> {
        match killpg(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::host_errno(
                "signal process group",
                format!("/proc/{}", self.pid),
                e,
            )),
        }
    }

    /// Blocks until the child is reaped and yields its exit outcome.
    pub async fn wait(self) -> Result<ExitOutcome> {
        let pid = self.pid;
        tokio::task::spawn_blocking(move || loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break Ok(ExitOutcome::exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => break Ok(ExitOutcome::signaled(signal)),
                // Stop/continue events are not terminal; keep waiting.
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    break Err(Error::host_errno("waitpid", format!("/proc/{pid}"), e));
                }
            }
        })
        .await
        .map_err(|e| Error::Startup(format!("wait task panicked: {e}")))?
    }
}

/// Creates the child with all requested isolation attributes bound in the
/// `clone3` call itself, stdout/stderr replaced by pipe write ends, and
/// stdin read from /dev/null.
pub fn spawn(spec: &SpawnSpec<'_>) -> Result<Spawned> {
    // Everything the child touches is prepared up front: between clone3
    // and execvp only async-signal-safe calls are permitted, and the
    // child of a threaded process must not allocate.
    let program = CString::new(spec.program)
        .map_err(|_| Error::Startup("program name contains a NUL byte".into()))?;
    let mut argv_owned = Vec::with_capacity(spec.args.len() + 1);
    argv_owned.push(program.clone());
    for arg in spec.args {
        argv_owned.push(
            CString::new(arg.as_str())
                .map_err(|_| Error::Startup("argument contains a NUL byte".into()))?,
        );
    }
    let mut argv: Vec<*const c_char> = argv_owned.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    let chroot = match spec.chroot {
        Some(path) => Some(
            CString::new(path.as_os_str().as_bytes())
                .map_err(|_| Error::Startup("root path contains a NUL byte".into()))?,
        ),
        None => None,
    };
    let chroot_ptr = chroot.as_ref().map(|c| c.as_ptr());

    let devnull: OwnedFd =
        File::open("/dev/null").map_err(|e| Error::host("open", "/dev/null", e))?.into();
    let (stdout_r, stdout_w) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::host_errno("pipe", "stdout", e))?;
    let (stderr_r, stderr_w) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::host_errno("pipe", "stderr", e))?;
    let devnull_fd = devnull.as_raw_fd();
    let stdout_fd = stdout_w.as_raw_fd();
    let stderr_fd = stderr_w.as_raw_fd();

    let mut flags: u64 = 0;
    if spec.new_pid_ns {
        flags |= libc::CLONE_NEWPID as u64;
    }
    if spec.new_net_ns {
        flags |= libc::CLONE_NEWNET as u64;
    }
    if spec.chroot.is_some() {
        flags |= libc::CLONE_NEWNS as u64;
    }
    let mut clone_args = CloneArgs {
        flags,
        exit_signal: libc::SIGCHLD as u64,
        ..Default::default()
    };
    if let Some(fd) = spec.cgroup_fd {
        clone_args.flags |= CLONE_INTO_CGROUP;
        clone_args.cgroup = fd as u64;
    }

    let pid = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut clone_args as *mut CloneArgs,
            std::mem::size_of::<CloneArgs>(),
        )
    };
    if pid < 0 {
        return Err(Error::host("clone3", spec.program, io::Error::last_os_error()));
    }
    if pid == 0 {
        // Child. Async-signal-safe calls only; failures end in _exit(127).
        unsafe {
            libc::setpgid(0, 0);
            libc::dup2(devnull_fd, 0);
            libc::dup2(stdout_fd, 1);
            libc::dup2(stderr_fd, 2);
            if let Some(root) = chroot_ptr {
                if libc::chroot(root) != 0 {
                    libc::_exit(127);
                }
                if libc::chdir(c"/".as_ptr()) != 0 {
                    libc::_exit(127);
                }
            }
            libc::execvp(program.as_ptr(), argv.as_ptr());
            libc::_exit(127);
        }
    }

    let pid = Pid::from_raw(pid as i32);
    // Mirror the child's setpgid to close the race against an immediate
    // group signal; whichever side loses gets a benign error.
    let _ = nix::unistd::setpgid(pid, pid);
    drop(stdout_w);
    drop(stderr_w);
    drop(devnull);
    Ok(Spawned {
        handle: ChildHandle { pid },
        stdout: stdout_r,
        stderr: stderr_r,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    async fn read_all(fd: OwnedFd) -> Vec<u8> {
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            File::from(fd).read_to_end(&mut out).unwrap();
            out
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn spawns_and_reaps_a_plain_child() {
        let args = vec!["hello".to_string()];
        let spawned = spawn(&SpawnSpec {
            program: "echo",
            args: &args,
            ..Default::default()
        })
        .unwrap();
        assert!(spawned.handle.pgid() > 0);
        let stdout = read_all(spawned.stdout).await;
        let outcome = spawned.handle.wait().await.unwrap();
        assert_eq!(outcome.code, 0);
        assert!(outcome.error.is_empty());
        assert_eq!(stdout, b"hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let spawned = spawn(&SpawnSpec {
            program: "sh",
            args: &args,
            ..Default::default()
        })
        .unwrap();
        let outcome = spawned.handle.wait().await.unwrap();
        assert_eq!(outcome.code, 3);
        assert_eq!(outcome.error, "exit status: 3");
    }

    #[tokio::test]
    async fn kill_signals_the_whole_group() {
        let args = vec!["60".to_string()];
        let spawned = spawn(&SpawnSpec {
            program: "sleep",
            args: &args,
            ..Default::default()
        })
        .unwrap();
        spawned.handle.signal_group(Signal::SIGKILL).unwrap();
        let outcome = spawned.handle.wait().await.unwrap();
        assert_eq!(outcome.code, -1);
        assert!(outcome.error.contains("SIGKILL"), "{}", outcome.error);
    }

    #[tokio::test]
    async fn missing_program_exits_127() {
        let spawned = spawn(&SpawnSpec {
            program: "definitely-not-a-real-program",
            args: &[],
            ..Default::default()
        })
        .unwrap();
        let outcome = spawned.handle.wait().await.unwrap();
        assert_eq!(outcome.code, 127);
    }

    // Requires CAP_SYS_ADMIN; run as root with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore = "requires root for namespace creation"]
    async fn pid_namespace_makes_the_child_pid_one() {
        let args = vec!["-c".to_string(), "echo $$".to_string()];
        let spawned = spawn(&SpawnSpec {
            program: "sh",
            args: &args,
            new_pid_ns: true,
            ..Default::default()
        })
        .unwrap();
        let stdout = read_all(spawned.stdout).await;
        let outcome = spawned.handle.wait().await.unwrap();
        assert_eq!(outcome.code, 0);
        assert_eq!(stdout, b"1\n");
    }
}
