use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{ExitStatus, WorkerCommand, WorkerId};

/// Notifications a forked worker produces, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A message the worker sent over its channel.
    Message(serde_json::Value),
    /// The worker opened a network listener.
    Listening { address: Option<String> },
    /// The worker process terminated. Always the last event.
    Exit(ExitStatus),
}

/// Handle to one forked worker process.
#[async_trait]
pub trait WorkerProcess: Send + Sync + std::fmt::Debug {
    fn id(&self) -> WorkerId;

    fn pid(&self) -> Option<u32>;

    /// Alive, not asked to disconnect, and its channel is still open.
    fn is_connected(&self) -> bool;

    fn exit_status(&self) -> Option<ExitStatus>;

    /// Resolves once the process has terminated.
    async fn wait(&self) -> ExitStatus;

    async fn send(&self, message: serde_json::Value) -> crate::Result<()>;

    /// Asks the worker to shut down gracefully.
    async fn disconnect(&self) -> crate::Result<()>;

    /// Terminates the worker immediately.
    async fn kill(&self) -> crate::Result<()>;
}

/// A freshly forked worker and the stream of its events.
#[derive(Debug)]
pub struct Forked {
    pub worker: Arc<dyn WorkerProcess>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// The process-fork primitive.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn fork(&self, command: &WorkerCommand) -> crate::Result<Forked>;
}
