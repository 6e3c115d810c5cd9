//! Error types for descriptor stream construction.
//!
//! Mid-stream read failures travel as `std::io::Error` items inside the
//! stream itself; this module only covers the errors that can occur while
//! adopting a descriptor in the first place.

use thiserror::Error;

#[cfg(unix)]
use nix::errno::Errno;

/// Errors that can occur while wrapping a raw descriptor in an [`FdStream`].
///
/// [`FdStream`]: crate::stream::FdStream
#[derive(Debug, Error)]
pub enum FdStreamError {
    /// The descriptor refers to a directory, which cannot be streamed.
    #[error("descriptor refers to a directory")]
    IsADirectory,

    /// The descriptor is a kind we cannot stream (block/char device,
    /// symlink target, or anything else that is not a file, socket or
    /// pipe). Carries the raw `st_mode` for diagnostics.
    #[error("unsupported descriptor type (st_mode {mode:#o})")]
    UnsupportedKind { mode: u32 },

    /// An OS call failed during setup. Carries the failing operation and
    /// the raw errno, verbatim.
    #[cfg(unix)]
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },
}

impl FdStreamError {
    #[cfg(unix)]
    pub(crate) const fn os(op: &'static str, errno: Errno) -> Self {
        Self::Os { op, errno }
    }

    /// The raw OS error number, if this error came out of a failed syscall.
    #[cfg(unix)]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Os { errno, .. } => Some(*errno as i32),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn os_error_exposes_errno() {
        let err = FdStreamError::os("fstat", Errno::EBADF);
        assert_eq!(err.errno(), Some(Errno::EBADF as i32));
        assert!(err.to_string().contains("fstat"));
    }

    #[test]
    fn kind_errors_have_no_errno() {
        #[cfg(unix)]
        assert_eq!(FdStreamError::IsADirectory.errno(), None);
        let err = FdStreamError::UnsupportedKind { mode: 0o060_000 };
        assert!(err.to_string().contains("0o60000"));
    }
}
