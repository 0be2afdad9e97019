use anyhow::Context;
use forkpool_core::{
    ConfigWatcher, FleetConfig, FleetFile, Launcher, SpawnOptions, StatusKind, Strategy,
};
use forkpool_supervisor::Fleet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{error, info, warn};

use crate::cli::RunArgs;

const CONFIG_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Restart,
    Shutdown,
}

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let watcher = match &args.config {
        Some(path) => Some(
            ConfigWatcher::new(path)
                .await
                .with_context(|| format!("cannot load fleet file {}", path.display()))?,
        ),
        None => None,
    };
    let config = build_config(&args, watcher.as_ref().map(|w| (*w.get()).clone()))?;
    if config.script.is_none() {
        anyhow::bail!("no script given: pass SCRIPT or set \"script\" in the fleet file");
    }

    let fleet = Fleet::new(launcher()?, config)?;
    relay_status(&fleet);

    let (control_tx, mut control_rx) = mpsc::channel(4);
    setup_signal_handlers(control_tx);

    if let Err(e) = fleet.spawn_default().await {
        error!("Failed to start fleet: {}", e);
        fleet.stop().await;
        return Err(e.into());
    }
    info!("Fleet of {} worker(s) running", fleet.len());

    let mut config_check = time::interval(CONFIG_CHECK_INTERVAL);
    config_check.tick().await;

    loop {
        tokio::select! {
            Some(control) = control_rx.recv() => match control {
                Control::Restart => restart(&fleet, fleet.config().defaults.strategy).await,
                Control::Shutdown => break,
            },

            _ = config_check.tick() => {
                if let Some(ref watcher) = watcher {
                    match watcher.check_reload().await {
                        Ok(true) => {
                            info!("Fleet file changed, restarting workers");
                            restart(&fleet, watcher.get().options.strategy).await;
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Ignoring fleet file change: {}", e),
                    }
                }
            }
        }
    }

    info!("Stopping fleet...");
    fleet.stop().await;
    info!("All workers stopped");
    Ok(())
}

/// Merges the fleet file (if any) with command line flags; flags win.
fn build_config(args: &RunArgs, file: Option<FleetFile>) -> anyhow::Result<FleetConfig> {
    let mut config = match file {
        Some(file) => file.into_fleet_config(),
        None => FleetConfig {
            defaults: SpawnOptions::default().with_number(num_cpus::get()),
            ..FleetConfig::default()
        },
    };

    if let Some(script) = args.script() {
        config.script = Some(script.to_string());
        config.args = args.script_args().to_vec();
    }
    config.env.extend(args.env.iter().cloned());
    if let Some(cwd) = &args.cwd {
        config.cwd = Some(cwd.clone());
    }

    let defaults = &mut config.defaults;
    if let Some(number) = args.number {
        defaults.number = number;
    }
    if let Some(strategy) = args.strategy {
        defaults.strategy = strategy;
    }
    if let Some(timeout) = args.timeout {
        defaults.timeout = Duration::from_millis(timeout);
    }
    if let Some(ready_on) = args.ready_on {
        defaults.ready_on = ready_on;
    }
    if let Some(delay) = args.confirm_delay {
        defaults.confirm_delay = Duration::from_millis(delay);
    }
    if let Some(timeout) = args.disconnect_timeout {
        defaults.disconnect_timeout = Duration::from_millis(timeout);
    }
    defaults.validate()?;

    Ok(config)
}

fn launcher() -> anyhow::Result<Arc<dyn Launcher>> {
    #[cfg(unix)]
    {
        Ok(forkpool_supervisor::create_launcher()?)
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("forkpool run is only supported on unix platforms")
    }
}

async fn restart(fleet: &Fleet, strategy: Strategy) {
    info!("Restarting {} worker(s) ({})", fleet.len(), strategy);
    match fleet.restart(strategy).await {
        Ok(()) => info!("Restart complete"),
        Err(e) => error!("Restart failed: {}", e),
    }
}

fn relay_status(fleet: &Fleet) {
    let mut status = fleet.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => match event.event {
                    StatusKind::Spawn => {
                        info!(child = %event.child, "Worker {} spawned", event.id)
                    }
                    StatusKind::Exit => info!(
                        child = %event.child,
                        "Worker {} exited (code: {:?}, signal: {:?})",
                        event.id,
                        event.code,
                        event.signal
                    ),
                },
                Err(RecvError::Lagged(missed)) => warn!("Missed {} status events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn setup_signal_handlers(control_tx: mpsc::Sender<Control>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        tokio::spawn(async move {
            let (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::hangup()),
            ) else {
                error!("Failed to install signal handlers");
                let _ = control_tx.send(Control::Shutdown).await;
                return;
            };

            loop {
                let control = tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                        Control::Shutdown
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                        Control::Shutdown
                    }
                    _ = sighup.recv() => {
                        info!("Received SIGHUP");
                        Control::Restart
                    }
                };
                if control_tx.send(control).await.is_err() || control == Control::Shutdown {
                    return;
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
                let _ = control_tx.send(Control::Shutdown).await;
            }
        });
    }
}
