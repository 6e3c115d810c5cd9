//! Lifecycle event broadcasting.
//!
//! Every executor broadcasts its lifecycle transitions so observers (log
//! shippers, supervisors, UIs) can follow along without being in the
//! `run()` call path. Dropping behind is allowed; the channel is lossy
//! for slow subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::ExitReason;

/// Broadcast channel capacity for process events
const CHANNEL_CAPACITY: usize = 64;

/// A lifecycle event for one child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// The child was spawned and has a pid.
    Spawned { pid: u32 },
    /// A teardown step sent this signal to the child.
    TeardownSignal { pid: u32, signal: i32 },
    /// Teardown escalated to the unconditional kill.
    TeardownKill { pid: u32 },
    /// The child exited and has been reaped.
    Exited { reason: ExitReason },
}

/// Broadcaster for process lifecycle events.
#[derive(Debug, Clone)]
pub(crate) struct EventBroadcaster {
    sender: broadcast::Sender<ProcessEvent>,
}

impl EventBroadcaster {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Broadcast an event to all subscribers.
    pub(crate) fn broadcast(&self, event: ProcessEvent) {
        // Only log if there are receivers (avoid spam when nobody listens)
        if self.sender.receiver_count() > 0 {
            debug!(?event, "broadcasting process event");
            let _ = self.sender.send(event);
        }
    }

    /// Subscribe to events.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.broadcast(ProcessEvent::Spawned { pid: 7 });
        broadcaster.broadcast(ProcessEvent::Exited {
            reason: ExitReason::Exited(0),
        });

        assert_eq!(rx.recv().await.unwrap(), ProcessEvent::Spawned { pid: 7 });
        assert_eq!(
            rx.recv().await.unwrap(),
            ProcessEvent::Exited {
                reason: ExitReason::Exited(0)
            }
        );
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_string(&ProcessEvent::TeardownSignal { pid: 1, signal: 15 })
            .unwrap();
        assert!(json.contains("\"type\":\"teardown_signal\""));
    }
}
