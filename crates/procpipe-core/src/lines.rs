//! Line-oriented re-chunking of byte streams.
//!
//! [`LineChunks`] turns any stream of byte chunks into a stream of logical
//! lines. Chunk boundaries of the upstream are not meaningful; this
//! adapter buffers partial lines, splits exactly at `\n`, and bounds the
//! buffer so a newline-free firehose cannot grow memory without limit.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;

/// Default cap on buffered bytes while waiting for a newline.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Re-chunks a byte stream into lines.
///
/// Each delivered item is one logical line. Behavior at the edges:
///
/// - When the buffered byte total exceeds the configured maximum without a
///   newline in sight, everything buffered so far is flushed as one
///   (unterminated) chunk. The flush point is the entire pending buffer,
///   so a single oversized input chunk comes back out whole.
/// - With `drop_terminator` (the default), the trailing `\n` is stripped
///   from each delivered line; consecutive newlines yield consecutive
///   empty lines.
/// - On upstream end with leftover bytes, the unterminated tail is
///   delivered as a final chunk unless `drop_last_chunk_if_no_newline`
///   was set, in which case it is discarded.
/// - An upstream error is passed through and exhausts the stream.
///
/// The adapter is lazy and forward-only: nothing is pulled from upstream
/// beyond what is needed to find the next boundary.
pub struct LineChunks<S> {
    upstream: S,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    upstream_done: bool,
    failed: bool,
    drop_terminator: bool,
    drop_last_chunk_if_no_newline: bool,
    max_buffer_size: usize,
}

impl<S> LineChunks<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    /// Wrap `upstream` with the default settings: terminators dropped,
    /// unterminated tail kept, 1 MiB buffer cap.
    pub fn new(upstream: S) -> Self {
        Self {
            upstream,
            pending: VecDeque::new(),
            pending_bytes: 0,
            upstream_done: false,
            failed: false,
            drop_terminator: true,
            drop_last_chunk_if_no_newline: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    /// Keep or strip the trailing `\n` on delivered lines.
    #[must_use]
    pub const fn with_drop_terminator(mut self, drop: bool) -> Self {
        self.drop_terminator = drop;
        self
    }

    /// Discard (rather than deliver) a final unterminated chunk.
    #[must_use]
    pub const fn with_drop_last_chunk_if_no_newline(mut self, drop: bool) -> Self {
        self.drop_last_chunk_if_no_newline = drop;
        self
    }

    /// Cap on buffered bytes before an unterminated forced flush.
    #[must_use]
    pub const fn with_max_buffer_size(mut self, max: usize) -> Self {
        self.max_buffer_size = max;
        self
    }

    /// Cut one line out of the pending buffer, if a newline is present.
    fn cut_line(&mut self) -> Option<Bytes> {
        let mut chunk_index = None;
        for (i, chunk) in self.pending.iter().enumerate() {
            if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
                chunk_index = Some((i, pos));
                break;
            }
        }
        let (index, pos) = chunk_index?;

        let mut line = BytesMut::new();
        for _ in 0..index {
            if let Some(chunk) = self.pending.pop_front() {
                self.pending_bytes -= chunk.len();
                line.extend_from_slice(&chunk);
            }
        }
        let mut head = self.pending.pop_front()?;
        let rest = head.split_off(pos + 1);
        self.pending_bytes -= head.len();
        if !rest.is_empty() {
            self.pending.push_front(rest);
        }

        // The split point includes the newline; dropping the terminator
        // only affects what is delivered.
        if line.is_empty() {
            let end = if self.drop_terminator { pos } else { pos + 1 };
            return Some(head.slice(..end));
        }
        line.extend_from_slice(&head);
        if self.drop_terminator {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }

    /// Deliver everything buffered as one chunk (overflow or final tail).
    fn flush_pending(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.pending_bytes);
        while let Some(chunk) = self.pending.pop_front() {
            out.extend_from_slice(&chunk);
        }
        self.pending_bytes = 0;
        out.freeze()
    }
}

impl<S> Stream for LineChunks<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.failed {
                return Poll::Ready(None);
            }
            if let Some(line) = this.cut_line() {
                return Poll::Ready(Some(Ok(line)));
            }
            if this.upstream_done {
                if this.pending.is_empty() {
                    return Poll::Ready(None);
                }
                if this.drop_last_chunk_if_no_newline {
                    this.pending.clear();
                    this.pending_bytes = 0;
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(Ok(this.flush_pending())));
            }

            match ready!(Pin::new(&mut this.upstream).poll_next(cx)) {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let has_newline = chunk.contains(&b'\n');
                    this.pending_bytes += chunk.len();
                    this.pending.push_back(chunk);
                    if !has_newline && this.pending_bytes > this.max_buffer_size {
                        return Poll::Ready(Some(Ok(this.flush_pending())));
                    }
                }
                Some(Err(e)) => {
                    this.failed = true;
                    this.pending.clear();
                    this.pending_bytes = 0;
                    return Poll::Ready(Some(Err(e)));
                }
                None => this.upstream_done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use futures_util::stream;

    fn chunks(parts: &[&[u8]]) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        let owned: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        stream::iter(owned)
    }

    async fn lines_of<S>(split: LineChunks<S>) -> Vec<Bytes>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        split.map(|r| r.expect("line error")).collect().await
    }

    #[tokio::test]
    async fn splits_across_chunk_boundaries() {
        let lines = lines_of(LineChunks::new(chunks(&[b"ab\ncd\n", b"ef"]))).await;
        assert_eq!(lines, vec!["ab", "cd", "ef"]);
    }

    #[tokio::test]
    async fn partial_line_spanning_chunks_is_joined() {
        let lines = lines_of(LineChunks::new(chunks(&[b"he", b"llo\nwo", b"rld\n"]))).await;
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn consecutive_newlines_yield_empty_lines() {
        let lines = lines_of(LineChunks::new(chunks(&[b"a\n\n\nb\n"]))).await;
        assert_eq!(lines, vec!["a", "", "", "b"]);
    }

    #[tokio::test]
    async fn terminator_is_kept_when_asked() {
        let lines = lines_of(
            LineChunks::new(chunks(&[b"a\nb\n"])).with_drop_terminator(false),
        )
        .await;
        assert_eq!(lines, vec!["a\n", "b\n"]);
    }

    #[tokio::test]
    async fn empty_upstream_yields_nothing() {
        let lines = lines_of(LineChunks::new(chunks(&[]))).await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn unterminated_tail_is_kept_by_default() {
        let lines = lines_of(LineChunks::new(chunks(&[b"abc"]))).await;
        assert_eq!(lines, vec!["abc"]);
    }

    #[tokio::test]
    async fn unterminated_tail_is_dropped_when_asked() {
        let lines = lines_of(
            LineChunks::new(chunks(&[b"abc"])).with_drop_last_chunk_if_no_newline(true),
        )
        .await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn oversized_line_is_force_flushed() {
        let max = 64;
        let big = vec![b'x'; max * 2];
        let lines = lines_of(
            LineChunks::new(chunks(&[big.as_slice()])).with_max_buffer_size(max),
        )
        .await;
        // The whole pending buffer is the flush point; nothing hangs.
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), max * 2);
    }

    #[tokio::test]
    async fn flush_resumes_normal_splitting() {
        let max = 8;
        let lines = lines_of(
            LineChunks::new(chunks(&[b"0123456789", b"a\nb\n"])).with_max_buffer_size(max),
        )
        .await;
        assert_eq!(lines, vec!["0123456789", "a", "b"]);
    }

    #[test]
    fn nothing_is_pulled_until_the_consumer_polls() {
        let mut split = tokio_test::task::spawn(LineChunks::new(
            futures_util::stream::pending::<io::Result<Bytes>>(),
        ));
        assert!(split.poll_next().is_pending());
    }

    #[tokio::test]
    async fn upstream_error_is_surfaced_then_stream_ends() {
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"ok\n")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
        ];
        let mut split = LineChunks::new(stream::iter(items));
        assert_eq!(split.next().await.unwrap().unwrap(), "ok");
        assert!(split.next().await.unwrap().is_err());
        assert!(split.next().await.is_none());
    }
}
