pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod process;
pub mod state;

pub use backoff::Backoff;
pub use config::{
    BackoffConfig, ChildOptions, ConfigWatcher, FleetConfig, FleetFile, ReadyOn, SpawnOptions,
    Strategy, WorkerCommand,
};
pub use error::{Error, Result};
pub use events::{EventSink, LogEvent, StatusEvent, StatusKind};
pub use launcher::{Forked, Launcher, WorkerEvent, WorkerProcess};
pub use process::{ExitStatus, ProcessBuilder};
pub use state::{ChildId, ChildState, WorkerId};
