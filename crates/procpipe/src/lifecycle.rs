//! Atomic lifecycle accounting for a single executor.
//!
//! Three pieces of state are touched by more than one task (the run
//! driver, the reaper, the teardown sequencer, stream consumers), so all
//! three are lock-free atomics: the lifecycle state machine, the pid
//! slot, and the output consumption ledger. Illegal transitions are
//! programmer errors and panic; they are deliberately not recoverable.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

#[cfg(unix)]
use nix::unistd::Pid;

use crate::types::StreamId;

const NEVER_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

/// `NeverStarted → Running → FinishedExecuting`, forward-only.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(NEVER_STARTED),
        }
    }

    /// Transition `NeverStarted → Running`. Panics on a double `run()`.
    pub(crate) fn begin_run(&self) {
        if let Err(actual) = self.state.compare_exchange(
            NEVER_STARTED,
            RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            panic!(
                "run() called on an executor that is already {}",
                describe(actual)
            );
        }
    }

    /// Transition `Running → FinishedExecuting`. Called exactly once, when
    /// the termination notification fires (or the spawn fails).
    pub(crate) fn finish(&self) {
        if let Err(actual) =
            self.state
                .compare_exchange(RUNNING, FINISHED, Ordering::SeqCst, Ordering::SeqCst)
        {
            panic!(
                "illegal lifecycle transition to finished from {}",
                describe(actual)
            );
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FINISHED
    }

    pub(crate) fn describe_current(&self) -> &'static str {
        describe(self.state.load(Ordering::SeqCst))
    }
}

fn describe(state: u8) -> &'static str {
    match state {
        NEVER_STARTED => "never started",
        RUNNING => "running",
        FINISHED => "finished executing",
        _ => "corrupt",
    }
}

const PID_UNSET: i32 = 0;
const PID_REAPED: i32 = -1;

/// The pid slot: 0 until the spawn succeeds, the OS pid while the child
/// is alive, and a sentinel once it has been reaped so teardown can never
/// signal a reused pid.
#[derive(Debug)]
#[cfg(unix)]
pub(crate) struct PidCell(AtomicI32);

#[cfg(unix)]
impl PidCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicI32::new(PID_UNSET))
    }

    pub(crate) fn record(&self, pid: u32) {
        self.0.store(pid as i32, Ordering::SeqCst);
    }

    pub(crate) fn mark_reaped(&self) {
        self.0.store(PID_REAPED, Ordering::SeqCst);
    }

    /// The live pid, if the child has been spawned and not yet reaped.
    pub(crate) fn current(&self) -> Option<Pid> {
        match self.0.load(Ordering::SeqCst) {
            PID_UNSET | PID_REAPED => None,
            pid => Some(Pid::from_raw(pid)),
        }
    }
}

const STDOUT_CONSUMED: u8 = 0b0001;
const STDERR_CONSUMED: u8 = 0b0010;
const STDOUT_NOT_STREAMED: u8 = 0b0100;
const STDERR_NOT_STREAMED: u8 = 0b1000;

/// Tracks that each declared `stream` output is consumed exactly once.
///
/// For each of stdout/stderr, by the time the executor is released either
/// the output was declared non-streamed or it was consumed exactly once.
/// Anything else is API misuse and panics.
#[derive(Debug)]
pub(crate) struct ConsumptionLedger(AtomicU8);

impl ConsumptionLedger {
    pub(crate) fn new(stdout_streamed: bool, stderr_streamed: bool) -> Self {
        let mut bits = 0;
        if !stdout_streamed {
            bits |= STDOUT_NOT_STREAMED;
        }
        if !stderr_streamed {
            bits |= STDERR_NOT_STREAMED;
        }
        Self(AtomicU8::new(bits))
    }

    fn bits_for(stream: StreamId) -> (u8, u8) {
        match stream {
            StreamId::Stdout => (STDOUT_CONSUMED, STDOUT_NOT_STREAMED),
            StreamId::Stderr => (STDERR_CONSUMED, STDERR_NOT_STREAMED),
        }
    }

    /// Record a consumption. Panics when the output was not declared
    /// `stream`, or when it has already been consumed.
    pub(crate) fn claim(&self, stream: StreamId) {
        let (consumed, not_streamed) = Self::bits_for(stream);
        let previous = self.0.fetch_or(consumed, Ordering::SeqCst);
        assert!(
            previous & not_streamed == 0,
            "{stream} was not configured with OutputPolicy::Stream"
        );
        assert!(
            previous & consumed == 0,
            "{stream} was already consumed; streamed outputs are single-consumer"
        );
    }

    pub(crate) fn is_streamed(&self, stream: StreamId) -> bool {
        let (_, not_streamed) = Self::bits_for(stream);
        self.0.load(Ordering::SeqCst) & not_streamed == 0
    }

    /// The destruction-time invariant: declared non-streamed, or consumed.
    pub(crate) fn verify_consumed(&self) {
        let bits = self.0.load(Ordering::SeqCst);
        for stream in [StreamId::Stdout, StreamId::Stderr] {
            let (consumed, not_streamed) = Self::bits_for(stream);
            assert!(
                bits & (consumed | not_streamed) != 0,
                "{stream} was configured with OutputPolicy::Stream but never consumed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_walks_forward() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_finished());
        lifecycle.begin_run();
        lifecycle.finish();
        assert!(lifecycle.is_finished());
    }

    #[test]
    #[should_panic(expected = "already running")]
    fn double_run_panics() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_run();
        lifecycle.begin_run();
    }

    #[test]
    #[should_panic(expected = "illegal lifecycle transition")]
    fn finish_before_run_panics() {
        let lifecycle = Lifecycle::new();
        lifecycle.finish();
    }

    #[test]
    #[cfg(unix)]
    fn pid_cell_hides_sentinels() {
        let cell = PidCell::new();
        assert_eq!(cell.current(), None);
        cell.record(4242);
        assert_eq!(cell.current(), Some(Pid::from_raw(4242)));
        cell.mark_reaped();
        assert_eq!(cell.current(), None);
    }

    #[test]
    fn ledger_accepts_single_consumption() {
        let ledger = ConsumptionLedger::new(true, true);
        ledger.claim(StreamId::Stdout);
        ledger.claim(StreamId::Stderr);
        ledger.verify_consumed();
    }

    #[test]
    #[should_panic(expected = "already consumed")]
    fn ledger_rejects_double_consumption() {
        let ledger = ConsumptionLedger::new(true, true);
        ledger.claim(StreamId::Stdout);
        ledger.claim(StreamId::Stdout);
    }

    #[test]
    #[should_panic(expected = "not configured with OutputPolicy::Stream")]
    fn ledger_rejects_consuming_unstreamed_output() {
        let ledger = ConsumptionLedger::new(false, true);
        ledger.claim(StreamId::Stdout);
    }

    #[test]
    #[should_panic(expected = "never consumed")]
    fn ledger_flags_forgotten_stream() {
        let ledger = ConsumptionLedger::new(true, false);
        ledger.verify_consumed();
    }

    #[test]
    fn ledger_ignores_unstreamed_outputs_on_verify() {
        let ledger = ConsumptionLedger::new(false, false);
        ledger.verify_consumed();
    }
}
