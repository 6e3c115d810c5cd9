//! Run-and-collect conveniences.
//!
//! [`run_collecting_output`] drives a full run while accumulating the
//! streamed outputs in memory, with an optional per-stream byte limit.
//! A stream that exceeds its limit fails the call with
//! [`ExecError::OutputLimitExceeded`] naming that stream, and the child
//! is torn down so the run still resolves.

use std::borrow::Cow;
use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use procpipe_core::FdStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::executor::ProcessExecutor;
use crate::spec::ProcessSpec;
use crate::types::{ExitReason, StreamId};

/// Everything a collected run produced.
#[derive(Debug, Clone)]
pub struct CollectedOutput {
    /// How the child finished.
    pub exit_reason: ExitReason,
    /// Collected stdout; empty unless stdout was `OutputPolicy::Stream`.
    pub stdout: Bytes,
    /// Collected stderr; empty unless stderr was `OutputPolicy::Stream`.
    pub stderr: Bytes,
}

impl CollectedOutput {
    /// Stdout decoded as UTF-8, lossily.
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr decoded as UTF-8, lossily.
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Run the child described by `spec` and collect its streamed outputs.
///
/// Streams whose policy is not `Stream` come back empty. When
/// `per_stream_limit_bytes` is set, a stream growing past the limit
/// fails the run with [`ExecError::OutputLimitExceeded`] for that stream
/// specifically — the other stream's collection is unaffected — and the
/// child is torn down before the error is returned.
pub async fn run_collecting_output(
    spec: ProcessSpec,
    per_stream_limit_bytes: Option<usize>,
) -> Result<CollectedOutput, ExecError> {
    let executor = ProcessExecutor::new(spec)?;
    let stdout = executor.take_output_if_streamed(StreamId::Stdout);
    let stderr = executor.take_output_if_streamed(StreamId::Stderr);

    let cancel = CancellationToken::new();

    let mut stdout_task = spawn_collector(stdout, per_stream_limit_bytes, StreamId::Stdout);
    let mut stderr_task = spawn_collector(stderr, per_stream_limit_bytes, StreamId::Stderr);

    let collectors = async {
        let mut stdout_result = None;
        let mut stderr_result = None;
        while stdout_result.is_none() || stderr_result.is_none() {
            tokio::select! {
                result = &mut stdout_task, if stdout_result.is_none() => {
                    let result = flatten(result);
                    if result.is_err() {
                        // Nobody will read the rest; stop the child.
                        cancel.cancel();
                    }
                    stdout_result = Some(result);
                }
                result = &mut stderr_task, if stderr_result.is_none() => {
                    let result = flatten(result);
                    if result.is_err() {
                        cancel.cancel();
                    }
                    stderr_result = Some(result);
                }
            }
        }
        (
            stdout_result.expect("set by loop"),
            stderr_result.expect("set by loop"),
        )
    };

    let (run_result, (stdout_result, stderr_result)) =
        tokio::join!(executor.run_until_cancelled(cancel.clone()), collectors);

    // A limit violation outranks the (torn-down) child's exit status.
    let stdout = stdout_result?;
    let stderr = stderr_result?;
    let exit_reason = run_result?;

    Ok(CollectedOutput {
        exit_reason,
        stdout,
        stderr,
    })
}

fn spawn_collector(
    stream: Option<FdStream>,
    limit: Option<usize>,
    id: StreamId,
) -> JoinHandle<Result<Bytes, ExecError>> {
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return Ok(Bytes::new());
        };
        let mut collected = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ExecError::StreamRead { stream: id, source })?;
            if let Some(limit) = limit {
                if collected.len() + chunk.len() > limit {
                    return Err(ExecError::OutputLimitExceeded { stream: id, limit });
                }
            }
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    })
}

fn flatten(result: Result<Result<Bytes, ExecError>, tokio::task::JoinError>) -> Result<Bytes, ExecError> {
    match result {
        Ok(inner) => inner,
        Err(join_err) => Err(ExecError::Os {
            op: "output collection task",
            source: io::Error::other(join_err),
        }),
    }
}
