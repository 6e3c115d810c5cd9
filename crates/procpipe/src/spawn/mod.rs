//! Pluggable spawn-and-reap strategies.
//!
//! The executor does not talk to the OS process API directly; it goes
//! through the [`Spawner`] port so the "spawn + detect termination"
//! mechanism can be swapped per platform. Two implementations ship:
//!
//! - [`TokioSpawner`] (the default): `tokio::process`, which reaps
//!   through the runtime's own SIGCHLD handling.
//! - [`PosixSpawner`]: a raw `fork`/`execve` path with signal-driven
//!   reaping, for targets where the native process API's termination
//!   detection is unreliable.

mod native;
#[cfg(unix)]
mod posix;

pub use native::TokioSpawner;
#[cfg(unix)]
pub use posix::PosixSpawner;

use std::ffi::OsString;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::types::ExitReason;

/// Where one of the child's standard descriptors should point.
#[derive(Debug)]
pub enum ChildFd {
    /// `/dev/null` (EOF for stdin, discard for outputs).
    Null,
    /// Leave the parent's descriptor in place.
    Inherit,
    /// Install this descriptor. The spawner consumes it; the parent-side
    /// copy is closed once the child holds its own.
    Fd(OwnedFd),
}

/// Everything a spawner needs to start the child: argv, environment and
/// the already-resolved descriptor wiring.
#[derive(Debug)]
pub struct PreparedCommand {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub cwd: Option<PathBuf>,
    pub stdin: ChildFd,
    pub stdout: ChildFd,
    pub stderr: ChildFd,
}

/// A spawned child: its pid, and its termination notification.
#[async_trait]
pub trait ChildHandle: Send {
    /// The OS pid of the child.
    fn pid(&self) -> u32;

    /// Wait for the child to terminate and reap it. Resolves exactly
    /// once; the handle is useless afterwards.
    async fn wait(&mut self) -> io::Result<ExitReason>;
}

impl std::fmt::Debug for dyn ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildHandle")
            .field("pid", &self.pid())
            .finish()
    }
}

/// Strategy for spawning a child and detecting its termination.
///
/// Implementations must remap descriptors before the child can exec and
/// close the child-side descriptors in the parent once the spawn has
/// happened, so the child is the sole remaining holder.
#[async_trait]
pub trait Spawner: Send + Sync + std::fmt::Debug {
    async fn spawn(&self, command: PreparedCommand) -> io::Result<Box<dyn ChildHandle>>;
}
