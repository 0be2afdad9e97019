use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{ChildId, ExitStatus, WorkerId};

/// A human-readable status line from a child supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub child: ChildId,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Spawn,
    Exit,
}

/// Structured lifecycle record: `{event, id, code?, signal?}` tagged with the
/// owning child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub child: ChildId,
    pub event: StatusKind,
    pub id: WorkerId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signal: Option<String>,
}

impl StatusEvent {
    pub fn spawn(child: ChildId, id: WorkerId) -> Self {
        Self {
            child,
            event: StatusKind::Spawn,
            id,
            code: None,
            signal: None,
        }
    }

    pub fn exit(child: ChildId, id: WorkerId, status: &ExitStatus) -> Self {
        Self {
            child,
            event: StatusKind::Exit,
            id,
            code: status.code(),
            signal: status.signal().map(str::to_string),
        }
    }
}

/// Publisher side of the log and status streams.
///
/// Cloning is cheap; every clone publishes to the same subscribers. Events
/// published while nobody is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    logs: broadcast::Sender<LogEvent>,
    status: broadcast::Sender<StatusEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (logs, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        Self { logs, status }
    }

    pub fn log(&self, child: ChildId, message: impl Into<String>) {
        let message = message.into();
        info!(%child, "{}", message);
        let _ = self.logs.send(LogEvent { child, message });
    }

    pub fn status(&self, event: StatusEvent) {
        debug!(
            child = %event.child,
            worker = %event.id,
            "status {:?} (code: {:?}, signal: {:?})",
            event.event,
            event.code,
            event.signal
        );
        let _ = self.status.send(event);
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.logs.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }
}
