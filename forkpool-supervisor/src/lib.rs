mod child;
mod common;
mod fleet;
#[cfg(unix)]
mod launcher;
mod strategy;

pub use child::ChildSupervisor;
pub use common::WorkerRegistry;
pub use fleet::Fleet;
#[cfg(unix)]
pub use launcher::ProcessLauncher;

#[cfg(unix)]
use forkpool_core::{Launcher, Result};
#[cfg(unix)]
use std::sync::Arc;
#[cfg(unix)]
use tracing::debug;

/// Launcher that forks real processes on this platform.
#[cfg(unix)]
pub fn create_launcher() -> Result<Arc<dyn Launcher>> {
    debug!("Creating process launcher");
    let launcher = Arc::new(ProcessLauncher::new()?);
    Ok(launcher)
}
