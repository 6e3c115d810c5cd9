//! Single-consumer byte streams over raw OS descriptors.
//!
//! [`FdStream`] adopts one descriptor and exposes it as a backpressured
//! [`Stream`] of byte chunks. The read strategy is picked once, at
//! construction, from the descriptor kind:
//!
//! - regular files are read in chunks on the blocking pool, staged through
//!   a small bounded queue (the reader parks when the consumer lags);
//! - sockets and pipes are switched to non-blocking mode and read on
//!   demand through readiness notifications, so a slow consumer simply
//!   stops reading and the kernel buffer fills instead of process memory;
//! - directories and device nodes are rejected up front with a typed error.
//!
//! Mid-stream read failures are yielded as the next item, after which the
//! stream is exhausted and the descriptor is closed.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_core::Stream;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::FdStreamError;

/// Upper bound for a single read; one delivered chunk never exceeds this.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Depth of the staging queue between the blocking file reader and the
/// consumer. The reader parks once the consumer falls this far behind.
const FILE_QUEUE_DEPTH: usize = 4;

enum Inner {
    /// Regular file: chunked reads on the blocking pool, handed over
    /// through a bounded channel.
    File { rx: mpsc::Receiver<io::Result<Bytes>> },
    /// Socket or pipe: readiness-driven non-blocking reads, issued only
    /// when the consumer polls.
    Ready { fd: AsyncFd<OwnedFd> },
    /// EOF or a delivered error; the descriptor is already closed.
    Done,
}

/// A single-consumer, backpressured byte stream over one OS descriptor.
///
/// The stream owns its descriptor: construction either adopts the given
/// [`OwnedFd`] or duplicates a borrowed one, and the descriptor is closed
/// exactly once, when the stream terminates (EOF, error, or drop).
///
/// Must be created from within a tokio runtime; readiness registration and
/// the file reader both need the current reactor.
pub struct FdStream {
    inner: Inner,
}

impl std::fmt::Debug for FdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdStream").finish_non_exhaustive()
    }
}

impl FdStream {
    /// Adopt `fd`, taking ownership of it.
    ///
    /// Inspects the descriptor kind (`fstat`) and sets up the matching
    /// read strategy. Fails with [`FdStreamError::IsADirectory`] for
    /// directories, [`FdStreamError::UnsupportedKind`] for device nodes
    /// and other unstreamable kinds, and [`FdStreamError::Os`] for any
    /// syscall failure (raw errno preserved).
    pub fn new(fd: OwnedFd) -> Result<Self, FdStreamError> {
        // Round-trip through File for the fstat; the descriptor comes
        // back out unchanged.
        let file = File::from(fd);
        let metadata = file
            .metadata()
            .map_err(|e| FdStreamError::os("fstat", errno_of(&e)))?;
        let file_type = metadata.file_type();
        let fd = OwnedFd::from(file);

        if file_type.is_file() {
            Ok(Self {
                inner: Inner::File {
                    rx: spawn_file_reader(fd),
                },
            })
        } else if file_type.is_socket() || file_type.is_fifo() {
            set_nonblocking(fd.as_fd())?;
            let fd = AsyncFd::with_interest(fd, Interest::READABLE)
                .map_err(|e| FdStreamError::os("fd registration", errno_of(&e)))?;
            Ok(Self {
                inner: Inner::Ready { fd },
            })
        } else if file_type.is_dir() {
            Err(FdStreamError::IsADirectory)
        } else {
            Err(FdStreamError::UnsupportedKind {
                mode: metadata.mode(),
            })
        }
    }

    /// Duplicate `fd` and stream from the duplicate.
    ///
    /// The caller's descriptor stays untouched and can be closed
    /// independently of the stream.
    pub fn from_borrowed(fd: BorrowedFd<'_>) -> Result<Self, FdStreamError> {
        let owned = fd
            .try_clone_to_owned()
            .map_err(|e| FdStreamError::os("dup", errno_of(&e)))?;
        Self::new(owned)
    }
}

impl Stream for FdStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut close = false;

        let outcome = match &mut this.inner {
            Inner::Done => return Poll::Ready(None),
            Inner::File { rx } => match ready!(rx.poll_recv(cx)) {
                Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
                Some(Err(e)) => {
                    close = true;
                    Poll::Ready(Some(Err(e)))
                }
                None => {
                    close = true;
                    Poll::Ready(None)
                }
            },
            Inner::Ready { fd } => loop {
                let mut guard = match ready!(fd.poll_read_ready(cx)) {
                    Ok(guard) => guard,
                    Err(e) => {
                        close = true;
                        break Poll::Ready(Some(Err(e)));
                    }
                };
                let mut buf = vec![0u8; READ_CHUNK_SIZE];
                match guard.try_io(|inner| read_some(inner.get_ref(), &mut buf)) {
                    Ok(Ok(0)) => {
                        close = true;
                        break Poll::Ready(None);
                    }
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        break Poll::Ready(Some(Ok(Bytes::from(buf))));
                    }
                    Ok(Err(e)) => {
                        close = true;
                        break Poll::Ready(Some(Err(e)));
                    }
                    Err(_would_block) => {}
                }
            },
        };

        if close {
            // Terminal: drop the descriptor (and deregister it) eagerly
            // instead of waiting for the stream value itself to go away.
            this.inner = Inner::Done;
        }
        outcome
    }
}

fn read_some(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    nix::unistd::read(fd, buf).map_err(io::Error::from)
}

fn errno_of(e: &io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(0))
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<(), FdStreamError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|errno| FdStreamError::os("fcntl", errno))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|errno| FdStreamError::os("fcntl", errno))?;
    Ok(())
}

fn spawn_file_reader(fd: OwnedFd) -> mpsc::Receiver<io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(FILE_QUEUE_DEPTH);
    tokio::task::spawn_blocking(move || {
        let mut file = File::from(fd);
        loop {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if tx.blocking_send(Ok(Bytes::from(buf))).is_err() {
                        trace!("file stream consumer went away, stopping reader");
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    async fn collect_all(mut stream: FdStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.expect("read failed"));
        }
        out
    }

    #[tokio::test]
    async fn regular_file_is_streamed_in_order() {
        use std::io::Seek;

        let mut tmp = tempfile::tempfile().expect("tempfile");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&payload).expect("write");
        tmp.flush().expect("flush");
        tmp.seek(std::io::SeekFrom::Start(0)).expect("seek");

        let stream = FdStream::new(OwnedFd::from(tmp)).expect("adopt file");
        assert_eq!(collect_all(stream).await, payload);
    }

    #[tokio::test]
    async fn pipe_read_end_reaches_eof_when_writer_closes() {
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        nix::unistd::write(&write_end, b"through the pipe").expect("write");
        drop(write_end);

        let stream = FdStream::new(read_end).expect("adopt pipe");
        assert_eq!(collect_all(stream).await, b"through the pipe");
    }

    #[tokio::test]
    async fn socket_pair_is_streamed() {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        let mut theirs = theirs;
        theirs.write_all(b"socket bytes").expect("write");
        drop(theirs);

        let stream = FdStream::new(OwnedFd::from(ours)).expect("adopt socket");
        assert_eq!(collect_all(stream).await, b"socket bytes");
    }

    #[tokio::test]
    async fn directory_is_rejected() {
        let dir = File::open(".").expect("open cwd");
        let err = FdStream::new(OwnedFd::from(dir)).unwrap_err();
        assert!(matches!(err, FdStreamError::IsADirectory));
    }

    #[tokio::test]
    async fn borrowed_descriptor_stays_usable() {
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        nix::unistd::write(&write_end, b"once").expect("write");
        drop(write_end);

        let stream = FdStream::from_borrowed(read_end.as_fd()).expect("dup");
        assert_eq!(collect_all(stream).await, b"once");

        // The original read end is still ours to close.
        drop(read_end);
    }
}
