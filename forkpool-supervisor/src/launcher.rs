use async_trait::async_trait;
use forkpool_core::{
    Error, ExitStatus, Forked, Launcher, ProcessBuilder, Result, WorkerCommand, WorkerEvent,
    WorkerId, WorkerProcess,
};
use forkpool_ipc::{
    CHANNEL_ENV, ChannelListener, ControlMessage, WORKER_ID_ENV, read_frame, write_frame,
};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::WorkerRegistry;

/// How long the channel may keep delivering messages after the process died.
const CHANNEL_DRAIN: Duration = Duration::from_millis(250);

/// Time a disconnected worker gets to leave on its own before SIGTERM.
const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(1);

/// Forks workers as OS processes, each with its own unix socket channel.
///
/// Disconnecting a worker sends `{"cmd": "disconnect"}` and closes the
/// channel; a worker still running after the term grace gets SIGTERM.
pub struct ProcessLauncher {
    socket_dir: TempDir,
    next_id: AtomicU64,
    registry: WorkerRegistry,
    term_grace: Duration,
}

impl ProcessLauncher {
    pub fn new() -> Result<Self> {
        let socket_dir = tempfile::Builder::new().prefix("forkpool-").tempdir()?;
        debug!("Worker channels live in {:?}", socket_dir.path());
        Ok(Self {
            socket_dir,
            next_id: AtomicU64::new(0),
            registry: WorkerRegistry::new(),
            term_grace: DEFAULT_TERM_GRACE,
        })
    }

    /// Sets how long a disconnected worker may drain before SIGTERM. Zero
    /// signals it right away.
    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    /// Workers forked by this launcher that have not exited yet.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        for (id, pid) in self.registry.drain() {
            debug!("Killing leftover worker {} (pid {})", id, pid);
            let _ = send_signal(pid, Signal::SIGKILL);
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn fork(&self, command: &WorkerCommand) -> Result<Forked> {
        let id = WorkerId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let listener = ChannelListener::bind(self.socket_dir.path().join(format!("{id}.sock")))?;

        let child = ProcessBuilder::from_command(command)
            .env(CHANNEL_ENV, listener.path().to_string_lossy())
            .env(WORKER_ID_ENV, id.to_string())
            .spawn()?;
        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register(id, pid);
        }
        debug!("Forked worker {} with pid {:?}", id, pid);

        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (gone_tx, gone_rx) = watch::channel(false);

        let channel = tokio::spawn(run_channel(
            id,
            listener,
            events_tx.clone(),
            outbound_rx,
            gone_rx,
            shared.clone(),
        ));
        tokio::spawn(reap(Reaper {
            id,
            child,
            channel,
            events: events_tx,
            exit: exit_tx,
            gone: gone_tx,
            shared: shared.clone(),
            registry: self.registry.clone(),
        }));

        let worker = ForkedWorker {
            id,
            pid,
            shared,
            outbound: Mutex::new(Some(outbound_tx)),
            exit: exit_rx,
            term_grace: self.term_grace,
        };
        Ok(Forked {
            worker: Arc::new(worker),
            events: events_rx,
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    exited: AtomicBool,
    channel_closed: AtomicBool,
    disconnect_requested: AtomicBool,
}

#[derive(Debug)]
struct ForkedWorker {
    id: WorkerId,
    pid: Option<u32>,
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    exit: watch::Receiver<Option<ExitStatus>>,
    term_grace: Duration,
}

impl ForkedWorker {
    fn signal(&self, signal: Signal) -> Result<()> {
        match self.pid {
            Some(pid) if !self.shared.exited.load(Ordering::SeqCst) => send_signal(pid, signal),
            _ => Ok(()),
        }
    }

    fn unknown_exit(&self) -> ExitStatus {
        ExitStatus::new(
            None,
            None,
            self.shared.disconnect_requested.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl WorkerProcess for ForkedWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_connected(&self) -> bool {
        !self.shared.exited.load(Ordering::SeqCst)
            && !self.shared.disconnect_requested.load(Ordering::SeqCst)
            && !self.shared.channel_closed.load(Ordering::SeqCst)
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.borrow().clone()
    }

    async fn wait(&self) -> ExitStatus {
        let mut exit = self.exit.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|status| Option::clone(&status));
        status
            .or_else(|| self.exit_status())
            .unwrap_or_else(|| self.unknown_exit())
    }

    async fn send(&self, message: Value) -> Result<()> {
        let outbound = self.outbound.lock().clone();
        match outbound {
            Some(tx) => tx
                .send(message)
                .map_err(|_| Error::Channel(format!("channel of worker {} is closed", self.id))),
            None => Err(Error::Channel(format!(
                "worker {} is disconnecting",
                self.id
            ))),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if self.shared.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.disconnect_requested.store(true, Ordering::SeqCst);
        // Dropping the sender lets the writer close its half of the socket.
        let outbound = self.outbound.lock().take();
        if let Some(tx) = outbound {
            let _ = tx.send(ControlMessage::Disconnect.to_value());
        }
        if self.term_grace.is_zero() {
            return self.signal(Signal::SIGTERM);
        }

        let (id, pid, grace) = (self.id, self.pid, self.term_grace);
        let mut exit = self.exit.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(grace, exit.wait_for(Option::is_some))
                .await
                .is_ok()
            {
                return;
            }
            if let Some(pid) = pid {
                debug!("Worker {} still running after {:?}, sending SIGTERM", id, grace);
                if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                    warn!("Failed to terminate worker {}: {}", id, e);
                }
            }
        });
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| Error::InvalidArgument(format!("pid {pid} out of range")))?;
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn run_channel(
    id: WorkerId,
    listener: ChannelListener,
    events: mpsc::UnboundedSender<WorkerEvent>,
    outbound: mpsc::UnboundedReceiver<Value>,
    mut gone: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    let accepted = tokio::select! {
        accepted = listener.accept() => accepted,
        _ = gone.wait_for(|gone| *gone) => {
            trace!("Worker {} exited without opening its channel", id);
            shared.channel_closed.store(true, Ordering::SeqCst);
            return;
        }
    };
    let stream = match accepted {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to accept channel of worker {}: {}", id, e);
            shared.channel_closed.store(true, Ordering::SeqCst);
            return;
        }
    };
    debug!("Worker {} connected its channel", id);

    let (mut reader, writer) = stream.into_split();
    tokio::spawn(run_writer(id, writer, outbound));

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => {
                let event = match ControlMessage::parse(&message) {
                    Some(ControlMessage::Listening { address }) => {
                        WorkerEvent::Listening { address }
                    }
                    _ => WorkerEvent::Message(message),
                };
                let _ = events.send(event);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Channel of worker {} failed: {}", id, e);
                break;
            }
        }
    }
    debug!("Channel of worker {} closed", id);
    shared.channel_closed.store(true, Ordering::SeqCst);
}

async fn run_writer(
    id: WorkerId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            debug!("Dropping message for worker {}: {}", id, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct Reaper {
    id: WorkerId,
    child: Child,
    channel: JoinHandle<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    exit: watch::Sender<Option<ExitStatus>>,
    gone: watch::Sender<bool>,
    shared: Arc<Shared>,
    registry: WorkerRegistry,
}

async fn reap(mut reaper: Reaper) {
    let status = reaper.child.wait().await;
    reaper.shared.exited.store(true, Ordering::SeqCst);
    reaper.registry.unregister(reaper.id);
    let _ = reaper.gone.send(true);

    // Deliver whatever the worker wrote before it died.
    if tokio::time::timeout(CHANNEL_DRAIN, &mut reaper.channel)
        .await
        .is_err()
    {
        reaper.channel.abort();
    }

    let voluntary = reaper.shared.disconnect_requested.load(Ordering::SeqCst);
    let status = match status {
        Ok(status) => ExitStatus::from_std(status, voluntary),
        Err(e) => {
            warn!("Failed to wait for worker {}: {}", reaper.id, e);
            ExitStatus::new(None, None, voluntary)
        }
    };
    debug!("Worker {} {}", reaper.id, status);
    reaper.exit.send_replace(Some(status.clone()));
    let _ = reaper.events.send(WorkerEvent::Exit(status));
}
