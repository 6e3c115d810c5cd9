//! The process executor: one instance per spawned child.
//!
//! The executor resolves the per-stream policies into descriptor wiring
//! at construction, runs the spawn protocol, and coordinates the three
//! concurrent activities of a run: awaiting the termination notification,
//! feeding stdin, and (on cancellation) driving the teardown sequencer.
//! Output consumption happens independently, through the streams handed
//! out by [`ProcessExecutor::take_stdout`] / [`take_stderr`].
//!
//! [`take_stderr`]: ProcessExecutor::take_stderr

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use procpipe_core::FdStream;
use tokio::net::unix::pipe;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecError, SignalError};
use crate::events::{EventBroadcaster, ProcessEvent};
use crate::lifecycle::{ConsumptionLedger, Lifecycle, PidCell};
use crate::spawn::{ChildFd, PreparedCommand, Spawner, TokioSpawner};
use crate::spec::ProcessSpec;
use crate::stdin::{self, InputSource};
use crate::teardown::TeardownSequence;
use crate::types::{ExitReason, OutputPolicy, StreamId};

/// State shared between the run driver, the reaper task and teardown.
#[derive(Debug)]
struct Shared {
    lifecycle: Lifecycle,
    pid: PidCell,
    ledger: ConsumptionLedger,
    exit_tx: watch::Sender<Option<ExitReason>>,
    events: EventBroadcaster,
}

impl Shared {
    /// Publish the termination. The pid sentinel and lifecycle transition
    /// must be visible before anyone wakes on the exit notification, so
    /// teardown can never signal a reused pid.
    fn record_exit(&self, reason: ExitReason) {
        self.pid.mark_reaped();
        self.lifecycle.finish();
        self.events.broadcast(ProcessEvent::Exited { reason });
        let _ = self.exit_tx.send(Some(reason));
    }
}

/// The child-side wiring, consumed by the (single) `run()`.
struct ChildIo {
    stdin: ChildFd,
    stdout: ChildFd,
    stderr: ChildFd,
    feeder: Option<(pipe::Sender, InputSource)>,
}

/// Executes one child process, for the lifetime of that child.
///
/// Construct with a [`ProcessSpec`], then drive [`run`] (or
/// [`run_until_cancelled`]) while independently consuming any streamed
/// outputs. Must be created from within a tokio runtime.
///
/// # Contract
///
/// Misuse panics rather than returning an error: calling `run` twice,
/// consuming a streamed output twice (or one that was not declared
/// [`OutputPolicy::Stream`]), and dropping an executor that never ran,
/// is still running, or has an unconsumed streamed output.
///
/// [`run`]: ProcessExecutor::run
/// [`run_until_cancelled`]: ProcessExecutor::run_until_cancelled
pub struct ProcessExecutor {
    executable: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    teardown: TeardownSequence,
    spawner: Arc<dyn Spawner>,
    shared: Arc<Shared>,
    child_io: Mutex<Option<ChildIo>>,
    stdout_stream: Mutex<Option<FdStream>>,
    stderr_stream: Mutex<Option<FdStream>>,
}

impl ProcessExecutor {
    /// Build an executor with the default spawn strategy.
    pub fn new(spec: ProcessSpec) -> Result<Self, ExecError> {
        Self::with_spawner(spec, Arc::new(TokioSpawner))
    }

    /// Build an executor with an explicit spawn strategy.
    pub fn with_spawner(spec: ProcessSpec, spawner: Arc<dyn Spawner>) -> Result<Self, ExecError> {
        let stdout_streamed = spec.stdout.is_streamed();
        let stderr_streamed = spec.stderr.is_streamed();

        let (child_stdout, stdout_stream) = wire_output(spec.stdout)?;
        let (child_stderr, stderr_stream) = wire_output(spec.stderr)?;
        let (child_stdin, feeder) = wire_stdin(spec.stdin)?;

        let (exit_tx, _) = watch::channel(None);

        Ok(Self {
            executable: spec.executable,
            args: spec.args,
            env: spec.env,
            cwd: spec.cwd,
            teardown: spec.teardown,
            spawner,
            shared: Arc::new(Shared {
                lifecycle: Lifecycle::new(),
                pid: PidCell::new(),
                ledger: ConsumptionLedger::new(stdout_streamed, stderr_streamed),
                exit_tx,
                events: EventBroadcaster::new(),
            }),
            child_io: Mutex::new(Some(ChildIo {
                stdin: child_stdin,
                stdout: child_stdout,
                stderr: child_stderr,
                feeder,
            })),
            stdout_stream: Mutex::new(stdout_stream),
            stderr_stream: Mutex::new(stderr_stream),
        })
    }

    /// Take ownership of the streamed stdout.
    ///
    /// Panics if stdout was not declared [`OutputPolicy::Stream`] or has
    /// already been taken; a streamed output has exactly one consumer.
    pub fn take_stdout(&self) -> FdStream {
        self.shared.ledger.claim(StreamId::Stdout);
        self.stdout_stream
            .lock()
            .expect("stream slot lock poisoned")
            .take()
            .expect("stdout stream present after successful claim")
    }

    /// Take ownership of the streamed stderr. Same contract as
    /// [`take_stdout`](Self::take_stdout).
    pub fn take_stderr(&self) -> FdStream {
        self.shared.ledger.claim(StreamId::Stderr);
        self.stderr_stream
            .lock()
            .expect("stream slot lock poisoned")
            .take()
            .expect("stderr stream present after successful claim")
    }

    /// Take a streamed output without panicking when the policy was not
    /// `Stream`. Used by the collection conveniences.
    pub(crate) fn take_output_if_streamed(&self, stream: StreamId) -> Option<FdStream> {
        if !self.shared.ledger.is_streamed(stream) {
            return None;
        }
        Some(match stream {
            StreamId::Stdout => self.take_stdout(),
            StreamId::Stderr => self.take_stderr(),
        })
    }

    /// Subscribe to this executor's lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ProcessEvent> {
        self.shared.events.subscribe()
    }

    /// Send a signal to the child.
    ///
    /// Fails with [`SignalError::NoSuchProcess`] when the child was never
    /// spawned or has already been reaped; callers may legitimately race
    /// with natural exit.
    pub fn send_signal(&self, signal: i32) -> Result<(), SignalError> {
        let Some(pid) = self.shared.pid.current() else {
            return Err(SignalError::NoSuchProcess);
        };
        let signal = Signal::try_from(signal).map_err(SignalError::Os)?;
        match signal::kill(pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalError::NoSuchProcess),
            Err(errno) => Err(SignalError::Os(errno)),
        }
    }

    /// Run the child to completion.
    pub async fn run(&self) -> Result<ExitReason, ExecError> {
        self.run_until_cancelled(CancellationToken::new()).await
    }

    /// Run the child until it exits or `cancel` fires.
    ///
    /// Cancellation does not return early: it starts the teardown
    /// sequence, and this call still resolves only once the child has
    /// actually exited and been reaped. No zombie escapes a single call.
    pub async fn run_until_cancelled(
        &self,
        cancel: CancellationToken,
    ) -> Result<ExitReason, ExecError> {
        self.shared.lifecycle.begin_run();

        let ChildIo {
            stdin,
            stdout,
            stderr,
            feeder,
        } = self
            .child_io
            .lock()
            .expect("child io lock poisoned")
            .take()
            .expect("child io present on first run");

        let command = PreparedCommand {
            executable: self.executable.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            stdin,
            stdout,
            stderr,
        };

        let mut child = match self.spawner.spawn(command).await {
            Ok(child) => child,
            Err(source) => {
                // The caller must never observe a "running" executor for
                // a child that did not start. The child-side descriptors
                // died with the failed spawn, so streamed outputs (if
                // any) read EOF.
                drop(feeder);
                self.shared.pid.mark_reaped();
                self.shared.lifecycle.finish();
                return Err(ExecError::Spawn {
                    executable: self.executable.display().to_string(),
                    source,
                });
            }
        };

        let pid = child.pid();
        self.shared.pid.record(pid);
        self.shared.events.broadcast(ProcessEvent::Spawned { pid });
        debug!(pid, executable = %self.executable.display(), "child process started");

        // The reaper is the single owner of the termination notification;
        // everyone else (this call, teardown, event subscribers) observes
        // the watch channel. It runs as its own task so the exit is
        // recorded even if this future is dropped mid-flight.
        let shared = Arc::clone(&self.shared);
        let mut reaper: JoinHandle<io::Result<()>> = tokio::spawn(async move {
            match child.wait().await {
                Ok(reason) => {
                    debug!(pid, %reason, "child process exited");
                    shared.record_exit(reason);
                    Ok(())
                }
                Err(e) => {
                    warn!(pid, error = %e, "waiting for child termination failed");
                    shared.pid.mark_reaped();
                    shared.lifecycle.finish();
                    Err(e)
                }
            }
        });
        let mut reaper_done = false;

        let mut feeder_task: Option<JoinHandle<io::Result<()>>> =
            feeder.map(|(sender, source)| tokio::spawn(stdin::feed(source, sender)));

        let mut exit_rx = self.shared.exit_tx.subscribe();
        let mut cancelled = false;

        let reason = loop {
            tokio::select! {
                // Deterministic arm order: once the exit is recorded it
                // wins over late feeder failures and the cancel branch.
                biased;
                exited = async { exit_rx.wait_for(|reason| reason.is_some()).await.map(|guard| *guard) } => {
                    let recorded = exited.expect("exit watch sender lives in Shared");
                    break recorded.expect("wait_for guarantees a recorded exit");
                }
                result = &mut reaper, if !reaper_done => {
                    reaper_done = true;
                    match result {
                        Ok(Ok(())) => {} // exit recorded; the watch arm fires next
                        Ok(Err(e)) => {
                            return Err(ExecError::Os { op: "await child termination", source: e });
                        }
                        Err(join_err) => {
                            return Err(ExecError::Os {
                                op: "await child termination",
                                source: io::Error::other(join_err),
                            });
                        }
                    }
                }
                result = async { feeder_task.as_mut().expect("guarded by branch condition").await },
                        if feeder_task.is_some() => {
                    feeder_task = None;
                    let failure = match result {
                        Ok(Ok(())) => None, // input drained; keep awaiting the exit
                        Ok(Err(e)) => Some(e),
                        Err(join_err) => Some(io::Error::other(join_err)),
                    };
                    if let Some(e) = failure {
                        // A stdin failure aborts the run: tear the child
                        // down, wait out the exit, propagate the error.
                        self.teardown_now().await;
                        let _ = exit_rx.wait_for(|reason| reason.is_some()).await;
                        return Err(ExecError::Stdin(e));
                    }
                }
                () = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    debug!(pid, "run cancelled, starting teardown");
                    self.teardown_now().await;
                    // Loop around: the exit arm resolves once the child dies.
                }
            }
        };

        if let Some(task) = feeder_task {
            if task.is_finished() {
                // The child exited first. A broken pipe here is just the
                // child not reading all of its input; anything else is a
                // real feed failure.
                if let Ok(Err(e)) = task.await {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        return Err(ExecError::Stdin(e));
                    }
                }
            } else {
                // The child is gone; nothing reads the stdin pipe any more.
                task.abort();
                let _ = task.await;
            }
        }
        if !reaper_done {
            let _ = reaper.await;
        }
        Ok(reason)
    }

    /// Run the teardown sequence as an uncancellable inner task and wait
    /// for it to finish. Teardown answers cancellation, so it must not
    /// itself be re-cancelled mid-sequence.
    async fn teardown_now(&self) {
        let sequence = self.teardown.clone();
        let shared = Arc::clone(&self.shared);
        let mut exit_rx = self.shared.exit_tx.subscribe();
        let sequencer = tokio::spawn(async move {
            sequence
                .run(shared.pid.current(), &mut exit_rx, &shared.events)
                .await;
        });
        if sequencer.await.is_err() {
            warn!("teardown sequencer panicked");
        }
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        assert!(
            self.shared.lifecycle.is_finished(),
            "ProcessExecutor dropped while {}; drive run() to completion before release",
            self.shared.lifecycle.describe_current()
        );
        self.shared.ledger.verify_consumed();
    }
}

fn wire_output(policy: OutputPolicy) -> Result<(ChildFd, Option<FdStream>), ExecError> {
    match policy {
        OutputPolicy::Discard => Ok((ChildFd::Null, None)),
        OutputPolicy::Inherit => Ok((ChildFd::Inherit, None)),
        // A shared descriptor is already our private duplicate; from here
        // on both kinds are closed after the spawn installs them.
        OutputPolicy::OwnedDescriptor(fd) | OutputPolicy::SharedDescriptor(fd) => {
            Ok((ChildFd::Fd(fd), None))
        }
        OutputPolicy::Stream => {
            // CLOEXEC on both ends: no concurrently-spawned child may
            // inherit a stray write end and hold the stream open. The
            // spawner's dup2/Stdio installation clears the flag on the
            // child's own end.
            let (read_end, write_end) =
                nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|errno| ExecError::Os {
                    op: "pipe",
                    source: errno.into(),
                })?;
            let stream = FdStream::new(read_end)?;
            Ok((ChildFd::Fd(write_end), Some(stream)))
        }
    }
}

fn wire_stdin(
    source: InputSource,
) -> Result<(ChildFd, Option<(pipe::Sender, InputSource)>), ExecError> {
    if source.is_empty_source() {
        // Statically-empty input: no pipe, no feeder task; the child reads
        // immediate EOF.
        return Ok((ChildFd::Null, None));
    }
    let (read_end, write_end) =
        nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|errno| ExecError::Os {
            op: "pipe",
            source: errno.into(),
        })?;
    let sender = pipe::Sender::from_owned_fd(write_end).map_err(|e| ExecError::Os {
        op: "stdin pipe registration",
        source: e,
    })?;
    Ok((ChildFd::Fd(read_end), Some((sender, source))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discard_policy_needs_no_consumption() {
        let executor = ProcessExecutor::new(
            ProcessSpec::new("/bin/true")
                .with_stdout(OutputPolicy::Discard)
                .with_stderr(OutputPolicy::Discard),
        )
        .expect("construct");
        let reason = executor.run().await.expect("run");
        assert!(reason.is_success());
        // Dropping without touching the outputs must be fine.
    }

    #[tokio::test]
    #[should_panic(expected = "already consumed")]
    async fn taking_stdout_twice_panics() {
        let executor = ProcessExecutor::new(ProcessSpec::new("/bin/true")).expect("construct");
        let _first = executor.take_stdout();
        let _second = executor.take_stdout();
    }

    #[tokio::test]
    #[should_panic(expected = "not configured with OutputPolicy::Stream")]
    async fn taking_a_discarded_output_panics() {
        let executor = ProcessExecutor::new(
            ProcessSpec::new("/bin/true").with_stdout(OutputPolicy::Discard),
        )
        .expect("construct");
        let _ = executor.take_stdout();
    }

    #[tokio::test]
    async fn send_signal_before_spawn_is_no_such_process() {
        let executor = ProcessExecutor::new(
            ProcessSpec::new("/bin/true")
                .with_stdout(OutputPolicy::Discard)
                .with_stderr(OutputPolicy::Discard),
        )
        .expect("construct");
        assert!(matches!(
            executor.send_signal(15),
            Err(SignalError::NoSuchProcess)
        ));
        // Satisfy the destruction contract.
        executor.run().await.expect("run");
    }
}
