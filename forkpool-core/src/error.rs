use std::time::Duration;
use thiserror::Error;

use crate::{ExitStatus, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} has already been configured")]
    AlreadyConfigured(String),

    #[error("Spawn timeout: worker {worker} was not ready within {timeout:?}")]
    SpawnTimeout { worker: WorkerId, timeout: Duration },

    #[error("Worker {worker} disconnected before readiness was confirmed")]
    ConfirmFailed { worker: WorkerId },

    #[error("Worker {worker} exited before becoming ready ({status})")]
    ExitedBeforeReady { worker: WorkerId, status: ExitStatus },

    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    #[error("ready can only be called by a forked worker")]
    NotForked,

    #[error("Channel error: {0}")]
    Channel(String),

    #[cfg(unix)]
    #[error("Unix error: {0}")]
    Unix(#[from] nix::errno::Errno),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors raised by a worker that went away while being brought up.
    pub fn is_worker_loss(&self) -> bool {
        matches!(
            self,
            Self::ConfirmFailed { .. } | Self::ExitedBeforeReady { .. } | Self::SpawnFailed(_)
        )
    }

    /// The worker a spawn error is about, when one was forked.
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            Self::SpawnTimeout { worker, .. }
            | Self::ConfirmFailed { worker }
            | Self::ExitedBeforeReady { worker, .. } => Some(*worker),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
