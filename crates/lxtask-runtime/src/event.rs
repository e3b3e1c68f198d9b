//! Task lifecycle event streaming.
//!
//! Events are broadcast; a subscriber that falls behind loses the oldest
//! events rather than slowing the supervisor down.

use chrono::{DateTime, Utc};
use lxtask_common::types::{ExitResult, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Number of events buffered per subscriber.
const EVENT_BUFFER: usize = 256;

/// What happened to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEventKind {
    /// The task's container was started.
    Started,
    /// A task was re-attached after a supervisor restart.
    Recovered,
    /// The container's init process terminated.
    Exited {
        /// Recorded outcome.
        result: ExitResult,
    },
    /// The task was asked to stop.
    Stopped,
    /// The task was removed from the driver.
    Destroyed,
}

/// A task lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task the event belongs to.
    pub task_id: TaskId,
    /// Event kind.
    #[serde(flatten)]
    pub kind: TaskEventKind,
    /// Human readable summary.
    pub message: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(task_id: TaskId, kind: TaskEventKind, message: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Fans task events out to subscribers.
#[derive(Debug, Clone)]
pub struct Eventer {
    sender: broadcast::Sender<TaskEvent>,
}

impl Eventer {
    /// Creates an eventer without subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    /// Publishes an event; it is dropped when nobody listens.
    pub fn emit(&self, event: TaskEvent) {
        tracing::debug!(task_id = %event.task_id, kind = ?event.kind, "task event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for Eventer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let eventer = Eventer::new();
        let mut rx = eventer.subscribe();
        eventer.emit(TaskEvent::new(TaskId::new("t1"), TaskEventKind::Started, "started"));
        eventer.emit(TaskEvent::new(TaskId::new("t1"), TaskEventKind::Stopped, "stopped"));

        assert_eq!(rx.recv().await.unwrap().kind, TaskEventKind::Started);
        assert_eq!(rx.recv().await.unwrap().kind, TaskEventKind::Stopped);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        Eventer::new().emit(TaskEvent::new(TaskId::new("t1"), TaskEventKind::Destroyed, ""));
    }

    #[test]
    fn exited_event_serializes_with_kind_tag() {
        let event = TaskEvent::new(
            TaskId::new("t1"),
            TaskEventKind::Exited {
                result: ExitResult::default(),
            },
            "exited",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "exited");
        assert_eq!(json["result"]["exit_code"], 0);
    }
}
