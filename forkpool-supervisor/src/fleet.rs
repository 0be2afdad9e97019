use forkpool_core::{
    Error, EventSink, FleetConfig, Launcher, LogEvent, Result, SpawnOptions, StatusEvent, Strategy,
    WorkerCommand,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::ChildSupervisor;
use crate::strategy;

/// A group of child supervisors running the same script.
///
/// Every child publishes to the fleet's log and status streams, so one
/// subscription sees the whole fleet.
pub struct Fleet {
    launcher: Arc<dyn Launcher>,
    config: FleetConfig,
    command: OnceCell<WorkerCommand>,
    children: RwLock<Vec<ChildSupervisor>>,
    events: EventSink,
}

impl Fleet {
    pub fn new(launcher: Arc<dyn Launcher>, config: FleetConfig) -> Result<Self> {
        config.backoff.validate()?;
        config.defaults.validate()?;
        let fleet = Self {
            launcher,
            events: EventSink::new(config.event_capacity),
            command: OnceCell::new(),
            children: RwLock::new(Vec::new()),
            config,
        };
        if let Some(script) = fleet.config.script.clone() {
            fleet.set_script(script)?;
        }
        Ok(fleet)
    }

    /// Sets the script workers run. Allowed once per fleet.
    pub fn set_script(&self, script: impl Into<String>) -> Result<()> {
        let command = WorkerCommand::new(script)?
            .with_args(&self.config.args)
            .with_env(self.config.env.clone())
            .with_cwd(self.config.cwd.clone());
        let script = command.script.clone();
        self.command
            .set(command)
            .map_err(|_| Error::AlreadyConfigured("script".to_string()))?;
        debug!("Fleet script set to {}", script);
        Ok(())
    }

    pub fn script(&self) -> Option<&str> {
        self.command.get().map(|command| command.script.as_str())
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Adds `options.number` children and spawns them with the requested
    /// strategy. Children are kept even when their spawn fails, so a later
    /// restart or stop still reaches them.
    pub async fn spawn(&self, options: &SpawnOptions) -> Result<()> {
        options.validate()?;
        let command = self
            .command
            .get()
            .ok_or_else(|| {
                Error::InvalidArgument("no script configured, call set_script first".to_string())
            })?
            .clone();

        let child_options = options.child_options(&self.config.backoff);
        let batch = (0..options.number)
            .map(|_| {
                ChildSupervisor::new(
                    self.launcher.clone(),
                    command.clone(),
                    child_options.clone(),
                    self.events.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        self.children.write().extend(batch.iter().cloned());

        info!(
            "Spawning {} worker(s) of {} ({})",
            batch.len(),
            command.script,
            options.strategy
        );
        strategy::run(options.strategy, batch, |child| async move {
            child.spawn().await
        })
        .await
    }

    /// Spawns with the defaults from the fleet configuration.
    pub async fn spawn_default(&self) -> Result<()> {
        let options = self.config.defaults.clone();
        self.spawn(&options).await
    }

    /// Replaces the worker of every child.
    pub async fn restart(&self, strategy: Strategy) -> Result<()> {
        let children = self.children();
        info!("Restarting {} worker(s) ({})", children.len(), strategy);
        strategy::run(strategy, children, |child| async move {
            child.replace().await
        })
        .await
    }

    /// Disconnects every child and waits until all of them are gone.
    pub async fn stop(&self) {
        let children = self.children();
        info!("Stopping {} worker(s)", children.len());
        futures::future::join_all(children.iter().map(ChildSupervisor::disconnect)).await;
    }

    pub fn children(&self) -> Vec<ChildSupervisor> {
        self.children.read().clone()
    }

    pub fn len(&self) -> usize {
        self.children.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.read().is_empty()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe_logs()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe_status()
    }
}
