use forkpool_ipc::WorkerChannel;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::cli::{DemoMode, DemoWorkerArgs};

pub async fn execute(args: DemoWorkerArgs) -> anyhow::Result<()> {
    let step = Duration::from_millis(args.step_ms);
    info!("Demo worker starting in {:?} mode", args.mode);
    for n in 1..=3 {
        sleep(step).await;
        debug!("step {}", n);
    }
    sleep(step).await;

    match args.mode {
        DemoMode::Ready => {
            let channel = forkpool_ipc::ready().await?;
            serve(channel).await
        }
        DemoMode::Listen => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let mut channel = WorkerChannel::connect().await?;
            channel.listening(listener.local_addr()?).await?;
            serve(channel).await
        }
        DemoMode::Broken => anyhow::bail!("demo worker broke during start-up"),
        DemoMode::BadExit => {
            let _channel = forkpool_ipc::ready().await?;
            sleep(Duration::from_millis(args.exit_after_ms)).await;
            anyhow::bail!("demo worker exiting with an error")
        }
        DemoMode::Silent => {
            let channel = WorkerChannel::connect().await?;
            serve(channel).await
        }
    }
}

/// Runs until the supervisor disconnects or sends SIGTERM.
async fn serve(mut channel: WorkerChannel) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = channel.disconnected() => result?,
        _ = sigterm.recv() => debug!("Received SIGTERM"),
    }
    info!("Demo worker shutting down");
    Ok(())
}
