//! Cancellation-triggered teardown with signal escalation.
//!
//! A teardown sequence is an ordered list of "send signal N, then wait up
//! to T" steps. The sequence always ends in an unconditional SIGKILL,
//! whether or not the caller's list spells it out. Each step stops early
//! if the child exits; the final kill guarantees the sequence terminates.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::events::{EventBroadcaster, ProcessEvent};
use crate::types::ExitReason;

/// One escalation step: send a signal, then give the child some grace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownStep {
    /// POSIX signal number to send (e.g. 15 for SIGTERM).
    pub signal: i32,
    /// How long to wait for the child to exit before escalating.
    pub grace: Duration,
}

impl TeardownStep {
    pub const fn new(signal: i32, grace: Duration) -> Self {
        Self { signal, grace }
    }
}

/// The ordered escalation plan run when a `run()` is cancelled.
///
/// An empty sequence (the default) means the child is killed outright.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownSequence {
    steps: Vec<TeardownStep>,
}

impl TeardownSequence {
    pub fn new(steps: Vec<TeardownStep>) -> Self {
        Self { steps }
    }

    /// The common plan: SIGTERM, a grace period, then SIGKILL.
    pub fn sigterm_then_kill(grace: Duration) -> Self {
        Self {
            steps: vec![TeardownStep::new(Signal::SIGTERM as i32, grace)],
        }
    }

    /// Run the escalation against `pid`, stopping as soon as `exited`
    /// reports the child gone. Always ends by sending SIGKILL unless an
    /// earlier step already saw the exit.
    pub(crate) async fn run(
        &self,
        pid: Option<Pid>,
        exited: &mut watch::Receiver<Option<ExitReason>>,
        events: &EventBroadcaster,
    ) {
        let Some(pid) = pid else {
            // Spawn never produced a pid (or the child is already reaped);
            // nothing to signal.
            debug!("teardown requested but no live pid is recorded");
            return;
        };

        for step in &self.steps {
            if exited.borrow().is_some() {
                debug!(%pid, "child exited before teardown step, stopping");
                return;
            }

            let Ok(signal) = Signal::try_from(step.signal) else {
                warn!(signal = step.signal, "skipping teardown step with unknown signal");
                continue;
            };

            debug!(%pid, %signal, grace = ?step.grace, "sending teardown signal");
            events.broadcast(ProcessEvent::TeardownSignal {
                pid: pid.as_raw() as u32,
                signal: step.signal,
            });
            match signal::kill(pid, signal) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    // Already gone; the reaper will publish the exit.
                    debug!(%pid, "teardown signal target no longer exists");
                    return;
                }
                Err(errno) => {
                    warn!(%pid, %signal, %errno, "teardown signal failed, escalating");
                }
            }

            let grace = tokio::time::timeout(step.grace, exited.wait_for(|r| r.is_some()));
            if grace.await.is_ok() {
                debug!(%pid, "child exited within the grace period");
                return;
            }
        }

        if exited.borrow().is_some() {
            return;
        }
        debug!(%pid, "escalating to SIGKILL");
        events.broadcast(ProcessEvent::TeardownKill {
            pid: pid.as_raw() as u32,
        });
        if let Err(errno) = signal::kill(pid, Signal::SIGKILL) {
            if errno != Errno::ESRCH {
                warn!(%pid, %errno, "SIGKILL failed");
            }
        }
    }
}
