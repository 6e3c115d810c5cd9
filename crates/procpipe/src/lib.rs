//! Async child process execution with backpressured stream plumbing.
//!
//! `procpipe` spawns one child process per [`ProcessExecutor`] and gives
//! callers:
//!
//! - asynchronous, backpressured access to the child's stdout/stderr as
//!   byte-chunk streams (optionally line-split via [`LineChunks`]);
//! - a per-stream wiring policy (discard, inherit, redirect to a
//!   descriptor, or stream back), with streamed outputs consumed exactly
//!   once;
//! - stdin feeding from any asynchronous byte source;
//! - deterministic, cancellation-triggered teardown: an escalating signal
//!   sequence that always ends in SIGKILL, with `run()` resolving only
//!   once the child has actually been reaped;
//! - a pluggable spawn-and-reap strategy for platforms where the native
//!   process API misbehaves.
//!
//! ```no_run
//! use procpipe::{ProcessExecutor, ProcessSpec};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let executor = ProcessExecutor::new(
//!     ProcessSpec::new("/bin/sh").with_args(["-c", "echo hello"]),
//! )?;
//! let stdout = executor.take_stdout();
//! let _stderr = executor.take_stderr();
//! let reason = executor.run().await?;
//! reason.check_success()?;
//! # let _ = stdout;
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("procpipe only supports unix platforms");

mod collect;
mod error;
mod events;
mod executor;
mod lifecycle;
pub mod spawn;
mod spec;
mod stdin;
mod teardown;
mod types;

pub use collect::{CollectedOutput, run_collecting_output};
pub use error::{ExecError, NonZeroExit, SignalError};
pub use events::ProcessEvent;
pub use executor::ProcessExecutor;
pub use spawn::{ChildFd, ChildHandle, PosixSpawner, PreparedCommand, Spawner, TokioSpawner};
pub use spec::ProcessSpec;
pub use stdin::InputSource;
pub use teardown::{TeardownSequence, TeardownStep};
pub use types::{ExitReason, OutputPolicy, StreamId};

// Re-export the stream layer so callers rarely need procpipe-core directly.
pub use procpipe_core::{FdStream, FdStreamError, LineChunks};
