//! Error types for process execution.
//!
//! Only environmental failures live here. Misuse of the API contract
//! (running twice, consuming a streamed output twice, dropping an
//! executor that never ran) is a programmer error and panics instead of
//! returning anything from this module.

use std::io;

use thiserror::Error;

use crate::types::{ExitReason, StreamId};

#[cfg(unix)]
use nix::errno::Errno;

/// Errors that can abort a `run()` or its conveniences.
#[derive(Debug, Error)]
pub enum ExecError {
    // === Spawn ===
    /// Spawning the child failed: executable missing, permission denied,
    /// fork/exec failure. Carries the raw OS error.
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    // === Streams ===
    /// Wiring up the stream plumbing failed.
    #[error(transparent)]
    StreamSetup(#[from] procpipe_core::FdStreamError),

    /// Feeding the child's stdin failed. Write errors are never
    /// swallowed; the first one aborts the run.
    #[error("stdin feed failed: {0}")]
    Stdin(#[source] io::Error),

    /// Reading a collected output stream failed.
    #[error("reading {stream} failed: {source}")]
    StreamRead {
        stream: StreamId,
        #[source]
        source: io::Error,
    },

    /// A collected stream went past its configured byte limit.
    #[error("{stream} produced more than {limit} bytes")]
    OutputLimitExceeded { stream: StreamId, limit: usize },

    // === Other ===
    /// Some other OS operation failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Errors from [`ProcessExecutor::send_signal`].
///
/// [`ProcessExecutor::send_signal`]: crate::executor::ProcessExecutor::send_signal
#[derive(Debug, Error)]
pub enum SignalError {
    /// The child was never spawned, or has already been reaped. This is
    /// recoverable: callers may legitimately race with natural exit.
    #[error("no such process")]
    NoSuchProcess,

    /// The kill call itself failed.
    #[cfg(unix)]
    #[error("kill failed: {0}")]
    Os(Errno),
}

/// The process did not finish with `exit(0)`.
///
/// Produced by [`ExitReason::check_success`]; a non-zero exit is not an
/// error from `run()` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("process failed with {reason}")]
pub struct NonZeroExit {
    /// How the process actually finished.
    pub reason: ExitReason,
}
