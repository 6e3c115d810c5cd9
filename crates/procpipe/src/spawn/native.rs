//! Spawn strategy backed by `tokio::process`.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{ChildFd, ChildHandle, PreparedCommand, Spawner};
use crate::types::ExitReason;

/// The default spawner: `tokio::process::Command` with explicit
/// environment and descriptor wiring. Termination is detected by the
/// runtime's child reaper.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

#[async_trait]
impl Spawner for TokioSpawner {
    async fn spawn(&self, command: PreparedCommand) -> io::Result<Box<dyn ChildHandle>> {
        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.args);

        // The child's environment is exactly what the spec resolved to;
        // nothing leaks in from the parent.
        cmd.env_clear();
        cmd.envs(command.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())));

        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(stdio_for(command.stdin));
        cmd.stdout(stdio_for(command.stdout));
        cmd.stderr(stdio_for(command.stderr));

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned child has no pid"))?;
        debug!(pid, executable = %command.executable.display(), "spawned via tokio");

        // `cmd` drops here, closing the parent-side copies of any
        // descriptors that were installed into the child.
        Ok(Box::new(TokioChild { pid, child }))
    }
}

fn stdio_for(fd: ChildFd) -> Stdio {
    match fd {
        ChildFd::Null => Stdio::null(),
        ChildFd::Inherit => Stdio::inherit(),
        ChildFd::Fd(fd) => Stdio::from(fd),
    }
}

struct TokioChild {
    pid: u32,
    child: Child,
}

#[async_trait]
impl ChildHandle for TokioChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> io::Result<ExitReason> {
        let status = self.child.wait().await?;
        Ok(status.into())
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
        let mut child = TokioSpawner
            .spawn(plain("/bin/sh", &["-c", "exit 3"]))
            .await
            .expect("spawn");
        assert!(child.pid() > 0);
        assert_eq!(child.wait().await.expect("wait"), ExitReason::Exited(3));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let result = TokioSpawner
            .spawn(plain("/definitely/not/here", &[]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn environment_is_exactly_what_was_given() {
        // HOME is set in the parent but must not leak; MARKER must arrive.
        let mut cmd = plain(
            "/bin/sh",
            &["-c", "test -z \"$HOME\" && test \"$MARKER\" = yes"],
        );
        cmd.env = vec![("MARKER".into(), "yes".into())];
        let mut child = TokioSpawner.spawn(cmd).await.expect("spawn");
        assert_eq!(child.wait().await.expect("wait"), ExitReason::Exited(0));
    }
}
