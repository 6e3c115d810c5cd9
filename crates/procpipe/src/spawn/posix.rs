//! Raw fork/exec spawn strategy with signal-driven reaping.
//!
//! Some native process APIs detect child termination unreliably; this
//! strategy sidesteps them entirely. The child is created with
//! `fork`/`execve`, exec failures are reported back through a CLOEXEC
//! pipe (EOF on that pipe means the exec succeeded), and termination is
//! observed poll-free by waking on SIGCHLD and reaping with
//! `waitpid(WNOHANG)`.
//!
//! This is the one module that needs `unsafe`: `fork`, handler resets and
//! `_exit` on the child side. Everything the child touches between fork
//! and exec is allocated beforehand.
#![allow(unsafe_code)]

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, ForkResult, Pid, fork, pipe2};
use tokio::signal::unix::{Signal as SignalStream, SignalKind, signal as signal_stream};
use tracing::debug;

use super::{ChildFd, ChildHandle, PreparedCommand, Spawner};
use crate::types::ExitReason;

/// Spawn strategy built on `fork`/`execve` plus SIGCHLD-driven reaping.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixSpawner;

#[async_trait]
impl Spawner for PosixSpawner {
    async fn spawn(&self, command: PreparedCommand) -> io::Result<Box<dyn ChildHandle>> {
        // Subscribe before forking so the first SIGCHLD cannot be missed.
        let sigchld = signal_stream(SignalKind::child())?;

        let pid = tokio::task::spawn_blocking(move || fork_exec(command))
            .await
            .map_err(io::Error::other)??;
        debug!(pid = pid.as_raw(), "spawned via fork/exec");

        Ok(Box::new(PosixChild { pid, sigchld }))
    }
}

/// Everything the child needs after the fork, allocated up front.
struct ChildPlan {
    exe: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    cwd: Option<CString>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl ChildPlan {
    fn prepare(command: PreparedCommand) -> io::Result<Self> {
        let exe = cstring_of(command.executable.as_os_str())?;
        let mut argv = vec![exe.clone()];
        for arg in &command.args {
            argv.push(cstring_of(arg)?);
        }
        let mut env = Vec::with_capacity(command.env.len());
        for (key, value) in &command.env {
            let mut pair = OsString::with_capacity(key.len() + value.len() + 1);
            pair.push(key);
            pair.push("=");
            pair.push(value);
            env.push(cstring_of(&pair)?);
        }
        let cwd = command
            .cwd
            .as_deref()
            .map(|dir| cstring_of(dir.as_os_str()))
            .transpose()?;

        Ok(Self {
            exe,
            argv,
            env,
            cwd,
            stdin: resolve_fd(command.stdin, NullMode::Read)?,
            stdout: resolve_fd(command.stdout, NullMode::Write)?,
            stderr: resolve_fd(command.stderr, NullMode::Write)?,
        })
    }
}

enum NullMode {
    Read,
    Write,
}

/// Resolve a [`ChildFd`] to the descriptor that will be installed, or
/// `None` to leave the parent's descriptor in place.
fn resolve_fd(fd: ChildFd, mode: NullMode) -> io::Result<Option<OwnedFd>> {
    match fd {
        ChildFd::Inherit => Ok(None),
        ChildFd::Fd(fd) => Ok(Some(raise_above_stdio(fd)?)),
        ChildFd::Null => {
            let file = match mode {
                NullMode::Read => File::open("/dev/null")?,
                NullMode::Write => File::options().write(true).open("/dev/null")?,
            };
            Ok(Some(raise_above_stdio(OwnedFd::from(file))?))
        }
    }
}

/// `dup2(n, n)` leaves FD_CLOEXEC in place, so a source descriptor that
/// already sits at 0..=2 would vanish at exec. Raise it above the stdio
/// range first.
fn raise_above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    if fd.as_raw_fd() > 2 {
        return Ok(fd);
    }
    let raised = fcntl(&fd, FcntlArg::F_DUPFD_CLOEXEC(3)).map_err(io::Error::from)?;
    // SAFETY: fcntl just returned this descriptor; nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(raised) })
}

fn cstring_of(s: &std::ffi::OsStr) -> io::Result<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedded nul byte"))
}

fn fork_exec(command: PreparedCommand) -> io::Result<Pid> {
    let executable = PathBuf::from(&command.executable);
    let plan = ChildPlan::prepare(command)?;

    // Exec failures travel back over this pipe; both ends are CLOEXEC so
    // a successful exec closes the write end and the parent reads EOF.
    let (err_read, err_write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;

    // Block signals across the fork so nothing runs a handler between
    // fork and execve; the parent restores its mask immediately.
    let mut old_mask = SigSet::empty();
    signal::pthread_sigmask(
        SigmaskHow::SIG_BLOCK,
        Some(&SigSet::all()),
        Some(&mut old_mask),
    )
    .map_err(io::Error::from)?;

    // SAFETY: the child only performs async-signal-safe operations from
    // here to execve; everything it needs was allocated before the fork.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(err_read);
            child_after_fork(&plan, &err_write);
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
            drop(err_write);
            // Parent-side copies of the child's descriptors.
            drop(plan);

            wait_for_exec(child, &err_read, &executable)
        }
        Err(errno) => {
            let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
            Err(errno.into())
        }
    }
}

/// Child side: reset signal state, remap descriptors, chdir, exec.
/// Never returns; any failure is written to the error pipe before `_exit`.
fn child_after_fork(plan: &ChildPlan, err_write: &OwnedFd) -> ! {
    // Reset every handler to its default; the child must not inherit the
    // parent's handlers (notably the runtime's SIGCHLD handling).
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        // SAFETY: restoring SIG_DFL is async-signal-safe.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    if let Err(errno) =
        signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
    {
        report_and_exit(err_write, errno);
    }

    if let Some(dir) = &plan.cwd {
        if let Err(errno) = unistd::chdir(dir.as_c_str()) {
            report_and_exit(err_write, errno);
        }
    }

    if let Some(fd) = &plan.stdin {
        if let Err(errno) = unistd::dup2_stdin(fd) {
            report_and_exit(err_write, errno);
        }
    }
    if let Some(fd) = &plan.stdout {
        if let Err(errno) = unistd::dup2_stdout(fd) {
            report_and_exit(err_write, errno);
        }
    }
    if let Some(fd) = &plan.stderr {
        if let Err(errno) = unistd::dup2_stderr(fd) {
            report_and_exit(err_write, errno);
        }
    }

    match unistd::execve(&plan.exe, &plan.argv, &plan.env) {
        Err(errno) => report_and_exit(err_write, errno),
        Ok(infallible) => match infallible {},
    }
}

fn report_and_exit(err_write: &OwnedFd, errno: Errno) -> ! {
    let bytes = (errno as i32).to_ne_bytes();
    let _ = unistd::write(err_write, &bytes);
    // SAFETY: `_exit` skips atexit handlers and is async-signal-safe,
    // unlike `std::process::exit`.
    unsafe { nix::libc::_exit(127) }
}

/// Parent side: wait for the exec verdict on the error pipe.
fn wait_for_exec(child: Pid, err_read: &OwnedFd, executable: &std::path::Path) -> io::Result<Pid> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    loop {
        match unistd::read(err_read, &mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    // EOF with no report: execve succeeded.
                    return Ok(child);
                }
                // Truncated report; the child died mid-write.
                let _ = waitpid(child, None);
                return Err(io::Error::from(Errno::EIO));
            }
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    let errno = Errno::from_raw(i32::from_ne_bytes(buf));
                    debug!(%errno, executable = %executable.display(), "exec failed in child");
                    // The failed child called _exit; reap it now so it
                    // never lingers as a zombie.
                    let _ = waitpid(child, None);
                    return Err(io::Error::from(errno));
                }
            }
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(errno.into()),
        }
    }
}

struct PosixChild {
    pid: Pid,
    sigchld: SignalStream,
}

#[async_trait]
impl ChildHandle for PosixChild {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    async fn wait(&mut self) -> io::Result<ExitReason> {
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitReason::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    return Ok(ExitReason::Signaled(sig as i32));
                }
                // Still alive (or stopped/continued): sleep until the
                // next SIGCHLD and try again.
                Ok(_) => {
                    self.sigchld.recv().await;
                }
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(executable: &str, args: &[&str]) -> PreparedCommand {
        PreparedCommand {
            executable: executable.into(),
            args: args.iter().copied().map(Into::into).collect(),
            env: Vec::new(),
            cwd: None,
            stdin: ChildFd::Null,
            stdout: ChildFd::Null,
            stderr: ChildFd::Null,
        }
    }

    #[tokio::test]
    async fn reports_exit_codes() {
        let mut child = PosixSpawner
            .spawn(plain("/bin/sh", &["-c", "exit 5"]))
            .await
            .expect("spawn");
        assert_eq!(child.wait().await.expect("wait"), ExitReason::Exited(5));
    }

    #[tokio::test]
    async fn exec_failure_surfaces_the_child_errno() {
        let err = PosixSpawner
            .spawn(plain("/definitely/not/here", &[]))
            .await
            .expect_err("spawn must fail");
        assert_eq!(err.raw_os_error(), Some(Errno::ENOENT as i32));
    }

    #[tokio::test]
    async fn signal_termination_is_reported() {
        let mut child = PosixSpawner
            .spawn(plain("/bin/sleep", &["30"]))
            .await
            .expect("spawn");
        let pid = Pid::from_raw(child.pid() as i32);
        signal::kill(pid, Signal::SIGTERM).expect("kill");
        assert_eq!(
            child.wait().await.expect("wait"),
            ExitReason::Signaled(Signal::SIGTERM as i32)
        );
    }

    #[tokio::test]
    async fn runs_in_the_requested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker"), b"").expect("marker");

        let mut cmd = plain("/bin/sh", &["-c", "test -e marker"]);
        cmd.cwd = Some(dir.path().to_path_buf());
        let mut child = PosixSpawner.spawn(cmd).await.expect("spawn");
        assert_eq!(child.wait().await.expect("wait"), ExitReason::Exited(0));
    }
}
