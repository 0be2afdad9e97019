#![allow(dead_code)]

use async_trait::async_trait;
use forkpool_core::{
    Error, ExitStatus, Forked, Launcher, Result, WorkerCommand, WorkerEvent, WorkerId,
    WorkerProcess,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep};

/// What a fake worker does after being forked.
#[derive(Debug, Clone)]
pub enum Script {
    /// Sends `{"cmd": "ready"}` after `after`.
    Ready { after: Duration },
    /// Reports a listening socket after `after`.
    Listen { after: Duration },
    /// Becomes ready, then exits with `code` after `lifetime`.
    ReadyThenExit {
        after: Duration,
        lifetime: Duration,
        code: i32,
    },
    /// Exits with `code` before ever becoming ready.
    Exit { after: Duration, code: i32 },
    /// Never reports anything.
    Silent,
}

impl Script {
    pub fn ready_in(ms: u64) -> Self {
        Script::Ready {
            after: Duration::from_millis(ms),
        }
    }

    pub fn listen_in(ms: u64) -> Self {
        Script::Listen {
            after: Duration::from_millis(ms),
        }
    }

    pub fn crash_after(ready_ms: u64, lifetime_ms: u64, code: i32) -> Self {
        Script::ReadyThenExit {
            after: Duration::from_millis(ready_ms),
            lifetime: Duration::from_millis(lifetime_ms),
            code,
        }
    }

    pub fn exit_in(ms: u64, code: i32) -> Self {
        Script::Exit {
            after: Duration::from_millis(ms),
            code,
        }
    }
}

/// One line per notable thing that happened, in order: `fork 1`,
/// `ready 1`, `disconnect 1`, `kill 1`, `exit 1`.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<(Instant, String)>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push((Instant::now(), entry.into()));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }

    pub fn times_of(&self, prefix: &str) -> Vec<Instant> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.starts_with(prefix))
            .map(|(t, _)| *t)
            .collect()
    }
}

#[derive(Debug)]
pub struct FakeWorker {
    id: WorkerId,
    obeys_disconnect: bool,
    connected: AtomicBool,
    disconnect_requested: AtomicBool,
    killed: AtomicBool,
    events: mpsc::UnboundedSender<WorkerEvent>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    sent: Mutex<Vec<Value>>,
    journal: Journal,
}

impl FakeWorker {
    fn emit(&self, event: WorkerEvent) {
        if self.exit_status().is_none() {
            let _ = self.events.send(event);
        }
    }

    pub fn terminate(&self, code: Option<i32>, signal: Option<&str>) {
        if self.exit_status().is_some() {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        let status = ExitStatus::new(
            code,
            signal.map(str::to_string),
            self.disconnect_requested.load(Ordering::SeqCst),
        );
        self.journal.record(format!("exit {}", self.id));
        self.exit_tx.send_replace(Some(status.clone()));
        let _ = self.events.send(WorkerEvent::Exit(status));
    }

    /// Closes the channel while the process keeps running.
    pub fn drop_channel(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn was_disconnected(&self) -> bool {
        self.disconnect_requested.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl WorkerProcess for FakeWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn pid(&self) -> Option<u32> {
        Some(10_000 + self.id.as_u64() as u32)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_rx.borrow().clone()
    }

    async fn wait(&self) -> ExitStatus {
        let mut exit = self.exit_rx.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|status| Option::clone(&status));
        status.unwrap_or_else(|| ExitStatus::new(None, None, false))
    }

    async fn send(&self, message: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Channel("not connected".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        self.journal.record(format!("disconnect {}", self.id));
        self.disconnect_requested.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.obeys_disconnect {
            let exit_tx = self.exit_tx.clone();
            let events = self.events.clone();
            let journal = self.journal.clone();
            let id = self.id;
            tokio::spawn(async move {
                sleep(Duration::from_millis(10)).await;
                if exit_tx.borrow().is_some() {
                    return;
                }
                let status = ExitStatus::new(Some(0), None, true);
                journal.record(format!("exit {id}"));
                exit_tx.send_replace(Some(status.clone()));
                let _ = events.send(WorkerEvent::Exit(status));
            });
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        if self.exit_status().is_none() {
            self.journal.record(format!("kill {}", self.id));
            self.killed.store(true, Ordering::SeqCst);
            self.terminate(None, Some("SIGKILL"));
        }
        Ok(())
    }
}

/// Launcher handing out fake workers that follow scripted behaviour.
///
/// Scripts are consumed in fork order; once the queue is empty every fork
/// uses the fallback script.
pub struct FakeLauncher {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    obeys_disconnect: AtomicBool,
    fail_forks: AtomicBool,
    next_id: AtomicU64,
    workers: Mutex<Vec<Arc<FakeWorker>>>,
    commands: Mutex<Vec<WorkerCommand>>,
    pub journal: Journal,
}

impl FakeLauncher {
    pub fn new(fallback: Script) -> Arc<Self> {
        Self::with_scripts(Vec::new(), fallback)
    }

    pub fn with_scripts(scripts: Vec<Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            obeys_disconnect: AtomicBool::new(true),
            fail_forks: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            journal: Journal::default(),
        })
    }

    /// Workers forked from now on ignore disconnect requests.
    pub fn stubborn(self: Arc<Self>) -> Arc<Self> {
        self.obeys_disconnect.store(false, Ordering::SeqCst);
        self
    }

    pub fn fail_forks(&self, fail: bool) {
        self.fail_forks.store(fail, Ordering::SeqCst);
    }

    pub fn forks(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn worker(&self, id: WorkerId) -> Arc<FakeWorker> {
        self.workers
            .lock()
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .expect("unknown worker")
    }

    pub fn workers(&self) -> Vec<Arc<FakeWorker>> {
        self.workers.lock().clone()
    }

    pub fn commands(&self) -> Vec<WorkerCommand> {
        self.commands.lock().clone()
    }

    pub fn as_launcher(self: &Arc<Self>) -> Arc<dyn Launcher> {
        self.clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn fork(&self, command: &WorkerCommand) -> Result<Forked> {
        if self.fail_forks.load(Ordering::SeqCst) {
            return Err(Error::SpawnFailed(format!("{}: refused", command.script)));
        }
        self.commands.lock().push(command.clone());

        let id = WorkerId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let worker = Arc::new(FakeWorker {
            id,
            obeys_disconnect: self.obeys_disconnect.load(Ordering::SeqCst),
            connected: AtomicBool::new(true),
            disconnect_requested: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            events: events_tx,
            exit_tx,
            exit_rx,
            sent: Mutex::new(Vec::new()),
            journal: self.journal.clone(),
        });
        self.journal.record(format!("fork {id}"));
        self.workers.lock().push(worker.clone());
        tokio::spawn(perform(worker.clone(), script));

        Ok(Forked {
            worker,
            events: events_rx,
        })
    }
}

async fn perform(worker: Arc<FakeWorker>, script: Script) {
    match script {
        Script::Ready { after } => {
            sleep(after).await;
            announce_ready(&worker);
        }
        Script::Listen { after } => {
            sleep(after).await;
            if worker.exit_status().is_none() {
                worker.journal.record(format!("listening {}", worker.id));
            }
            worker.emit(WorkerEvent::Listening {
                address: Some("127.0.0.1:3000".to_string()),
            });
        }
        Script::ReadyThenExit {
            after,
            lifetime,
            code,
        } => {
            sleep(after).await;
            announce_ready(&worker);
            sleep(lifetime).await;
            worker.terminate(Some(code), None);
        }
        Script::Exit { after, code } => {
            sleep(after).await;
            worker.terminate(Some(code), None);
        }
        Script::Silent => {}
    }
}

fn announce_ready(worker: &FakeWorker) {
    if worker.exit_status().is_some() {
        return;
    }
    worker.journal.record(format!("ready {}", worker.id));
    worker.emit(WorkerEvent::Message(json!({ "cmd": "hello" })));
    worker.emit(WorkerEvent::Message(json!({ "cmd": "ready" })));
}

pub fn ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
