//! Stdin feeding for child processes.
//!
//! The feeder drains a caller-supplied byte-chunk source into the child's
//! stdin pipe. Writes are non-blocking (the pipe sender is readiness
//! driven), so a child that never reads cannot stall the task that
//! spawned it. Closing the write end on completion is what delivers EOF
//! to the child.

use std::fmt;
use std::io;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tracing::trace;

/// Bytes to feed into the child's stdin.
///
/// The [`InputSource::Empty`] case is special: no pipe is allocated at
/// all and the child sees immediate EOF.
#[derive(Default)]
pub enum InputSource {
    /// Immediate EOF; no pipe or feeder task is set up.
    #[default]
    Empty,
    /// One in-memory buffer, written and then EOF.
    Buffer(Bytes),
    /// An arbitrary asynchronous chunk sequence.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl InputSource {
    /// Feed from an arbitrary chunk stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures_core::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    pub(crate) const fn is_empty_source(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("InputSource::Empty"),
            Self::Buffer(bytes) => write!(f, "InputSource::Buffer({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("InputSource::Stream(..)"),
        }
    }
}

impl From<Bytes> for InputSource {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<Vec<u8>> for InputSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for InputSource {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Buffer(Bytes::from_static(bytes))
    }
}

impl From<&'static str> for InputSource {
    fn from(text: &'static str) -> Self {
        Self::Buffer(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for InputSource {
    fn from(text: String) -> Self {
        Self::Buffer(Bytes::from(text.into_bytes()))
    }
}

/// Drain `source` into the pipe, then close it (EOF for the child).
///
/// The first write or source error aborts the feed and is returned; it is
/// never swallowed.
pub(crate) async fn feed(source: InputSource, mut sink: pipe::Sender) -> io::Result<()> {
    match source {
        InputSource::Empty => {}
        InputSource::Buffer(bytes) => {
            sink.write_all(&bytes).await?;
            sink.flush().await?;
        }
        InputSource::Stream(mut chunks) => {
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                sink.write_all(&chunk).await?;
                sink.flush().await?;
            }
        }
    }
    trace!("stdin source drained, closing the pipe");
    // `sink` drops here, which closes the write end.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use procpipe_core::FdStream;

    async fn read_all(fd: std::os::fd::OwnedFd) -> Vec<u8> {
        let mut stream = FdStream::new(fd).expect("adopt pipe");
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.expect("read"));
        }
        out
    }

    #[tokio::test]
    async fn buffer_is_written_then_eof() {
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        let sender = pipe::Sender::from_owned_fd(write_end).expect("sender");

        let feeder = tokio::spawn(feed(InputSource::from("fed bytes"), sender));
        assert_eq!(read_all(read_end).await, b"fed bytes");
        feeder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stream_chunks_arrive_in_order() {
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        let sender = pipe::Sender::from_owned_fd(write_end).expect("sender");

        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"one ")),
            Ok(Bytes::from_static(b"two ")),
            Ok(Bytes::from_static(b"three")),
        ]);
        let feeder = tokio::spawn(feed(InputSource::from_stream(chunks), sender));
        assert_eq!(read_all(read_end).await, b"one two three");
        feeder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn source_error_is_propagated() {
        let (_read_end, write_end) = nix::unistd::pipe().expect("pipe");
        let sender = pipe::Sender::from_owned_fd(write_end).expect("sender");

        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"start")),
            Err(io::Error::new(io::ErrorKind::TimedOut, "source died")),
        ]);
        let err = feed(InputSource::from_stream(chunks), sender)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
