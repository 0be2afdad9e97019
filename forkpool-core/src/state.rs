use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CHILD_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a child supervisor, stable across the workers it runs.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChildId(u64);

impl ChildId {
    pub fn next() -> Self {
        Self(NEXT_CHILD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "child-{}", self.0)
    }
}

/// Identity of one forked worker process, unique per launcher.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildState {
    /// Forked (or about to be) and waiting for readiness.
    New,
    /// Ready and past the confirmation window.
    Initialized,
    /// Readiness did not arrive before the spawn deadline.
    TimedOut,
    /// Shutdown requested, waiting for the worker to exit.
    Disconnecting,
    /// The worker exited on its own.
    Died,
    /// Shutdown completed.
    Stopped,
}

impl ChildState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Initialized)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Initialized => "initialized",
            Self::TimedOut => "timedout",
            Self::Disconnecting => "disconnecting",
            Self::Died => "died",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ChildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
