//! Shared types for process execution.

use std::fmt;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use serde::{Deserialize, Serialize};

use crate::error::NonZeroExit;

/// Why a child process stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ExitReason {
    /// The process exited on its own with this status code.
    Exited(i32),
    /// The process was terminated by this signal number.
    Signaled(i32),
}

impl ExitReason {
    /// Whether this is a clean `exit(0)`.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Turn anything other than `exit(0)` into a typed error.
    pub const fn check_success(self) -> Result<(), NonZeroExit> {
        match self {
            Self::Exited(0) => Ok(()),
            reason => Err(NonZeroExit { reason }),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

#[cfg(unix)]
impl From<std::process::ExitStatus> for ExitReason {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            Some(signal) => Self::Signaled(signal),
            None => Self::Exited(status.code().unwrap_or(-1)),
        }
    }
}

/// One of the child's output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// What to do with one of the child's output streams.
#[derive(Debug, Default)]
pub enum OutputPolicy {
    /// Send the output to `/dev/null`.
    Discard,
    /// The child writes straight into the parent's corresponding stream.
    Inherit,
    /// Redirect into a descriptor the executor takes ownership of and
    /// closes once the spawn has happened.
    OwnedDescriptor(OwnedFd),
    /// Redirect into a duplicate of a caller-owned descriptor. The caller
    /// keeps their descriptor and stays responsible for closing it; the
    /// executor only ever closes its duplicate.
    SharedDescriptor(OwnedFd),
    /// Pipe the output back to the caller as a consumable byte stream.
    /// Streamed outputs must be consumed exactly once.
    #[default]
    Stream,
}

impl OutputPolicy {
    /// Build a [`OutputPolicy::SharedDescriptor`] policy by duplicating
    /// `fd`. The duplicate is what the child inherits; `fd` itself is
    /// never closed by the executor.
    pub fn shared_descriptor(fd: BorrowedFd<'_>) -> io::Result<Self> {
        Ok(Self::SharedDescriptor(fd.try_clone_to_owned()?))
    }

    pub(crate) const fn is_streamed(&self) -> bool {
        matches!(self, Self::Stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_zero_is_success() {
        assert!(ExitReason::Exited(0).is_success());
        assert!(ExitReason::Exited(0).check_success().is_ok());
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let err = ExitReason::Exited(7).check_success().unwrap_err();
        assert_eq!(err.reason, ExitReason::Exited(7));
    }

    #[test]
    fn signal_is_never_success() {
        assert!(!ExitReason::Signaled(15).is_success());
        assert!(ExitReason::Signaled(9).check_success().is_err());
    }

    #[test]
    fn exit_reason_serializes_with_kind_tag() {
        let json = serde_json::to_string(&ExitReason::Signaled(15)).unwrap();
        assert!(json.contains("\"kind\":\"signaled\""));
        assert!(json.contains("\"value\":15"));
    }
}
