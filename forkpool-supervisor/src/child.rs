use forkpool_core::{
    Backoff, ChildId, ChildOptions, ChildState, Error, EventSink, ExitStatus, Forked, Launcher,
    LogEvent, ReadyOn, Result, StatusEvent, WorkerCommand, WorkerEvent, WorkerId, WorkerProcess,
};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, warn};

/// The worker a child currently tracks, plus the flag saying the
/// supervisor asked it to go away.
#[derive(Debug, Clone)]
struct Slot {
    worker: Arc<dyn WorkerProcess>,
    shutdown: Arc<AtomicBool>,
}

impl Slot {
    fn new(worker: Arc<dyn WorkerProcess>) -> Self {
        Self {
            worker,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn id(&self) -> WorkerId {
        self.worker.id()
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

struct Inner {
    id: ChildId,
    command: WorkerCommand,
    options: ChildOptions,
    launcher: Arc<dyn Launcher>,
    events: EventSink,
    // Lock order: `current` before `state`.
    current: Mutex<Option<Slot>>,
    state: RwLock<ChildState>,
    backoff: Mutex<Backoff>,
    // Set by disconnect, cleared by spawn and replace. Cancels pending respawns.
    halted: AtomicBool,
}

/// Keeps one worker process alive.
///
/// Spawns the worker, waits for it to report readiness, restarts it with
/// exponential backoff when it crashes, and replaces or stops it on demand.
/// Clones share the same child.
#[derive(Clone)]
pub struct ChildSupervisor {
    inner: Arc<Inner>,
}

impl ChildSupervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        command: WorkerCommand,
        options: ChildOptions,
        events: EventSink,
    ) -> Result<Self> {
        options.validate()?;
        let backoff = Backoff::new(&options.backoff)?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: ChildId::next(),
                command,
                options,
                launcher,
                events,
                current: Mutex::new(None),
                state: RwLock::new(ChildState::New),
                backoff: Mutex::new(backoff),
                halted: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> ChildId {
        self.inner.id
    }

    pub fn state(&self) -> ChildState {
        self.inner.state()
    }

    pub fn options(&self) -> &ChildOptions {
        &self.inner.options
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.inner.command
    }

    /// Identity of the current worker.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.inner.current.lock().as_ref().map(Slot::id)
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner
            .current
            .lock()
            .as_ref()
            .and_then(|slot| slot.worker.pid())
    }

    /// Delay the next automatic restart would wait.
    pub fn backoff_delay(&self) -> Duration {
        self.inner.backoff.lock().current_delay()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.events.subscribe_logs()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe_status()
    }

    /// Forks a worker and resolves once it is ready and survived the
    /// confirmation window.
    ///
    /// A worker that is still running is retired once the new one is forked.
    pub async fn spawn(&self) -> Result<()> {
        self.inner.halted.store(false, Ordering::SeqCst);
        self.inner.spawn_worker(None, None).await?;
        self.inner.backoff.lock().reset();
        Ok(())
    }

    /// Brings up a new worker and retires the current one once the new one
    /// is ready. When the new worker fails, the current one keeps serving.
    ///
    /// Returns without waiting for the old worker to exit.
    pub async fn replace(&self) -> Result<()> {
        let inner = &self.inner;
        let (previous, previous_state) = {
            let current = inner.current.lock();
            (current.clone(), inner.state())
        };
        inner.halted.store(false, Ordering::SeqCst);

        let keep = previous.as_ref().map(Slot::id);
        if let Err(err) = inner.spawn_worker(None, keep).await {
            inner.log(format!("replacement failed: {err}"));
            match previous {
                Some(previous) if previous.shutdown_requested() => {}
                Some(previous) if previous.worker.is_connected() => {
                    inner.reinstate(previous, previous_state);
                }
                // The serving worker crashed while its successor was starting.
                Some(previous)
                    if previous_state == ChildState::Initialized
                        && previous.worker.exit_status().is_some_and(|s| s.is_crash())
                        && err.worker().is_some_and(|w| inner.is_current(w)) =>
                {
                    let id = previous.id();
                    inner.reinstate(previous, ChildState::Died);
                    inner.schedule_respawn(id);
                }
                _ => {}
            }
            return Err(err);
        }
        inner.backoff.lock().reset();

        if let Some(old) = previous.filter(|slot| slot.worker.exit_status().is_none()) {
            inner.log(format!("worker disconnecting, worker ID: {}", old.id()));
            inner.retire_in_background(old);
        }
        Ok(())
    }

    /// Stops the child. The state becomes `Disconnecting` before this
    /// returns; the future resolves once the worker is gone, killing it if
    /// it outlives the disconnect timeout.
    ///
    /// Also cancels any restart that is waiting out its backoff delay.
    pub fn disconnect(&self) -> impl Future<Output = ()> + Send + 'static {
        let inner = self.inner.clone();
        let pending = inner.begin_disconnect();
        async move {
            if let Some(slot) = pending {
                inner.retire(&slot.worker).await;
                inner.finish_stop(slot.id());
            }
        }
    }
}

impl fmt::Debug for ChildSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSupervisor")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("worker", &self.worker_id())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> ChildState {
        *self.state.read()
    }

    fn set_state(&self, state: ChildState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(child = %self.id, "state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn log(&self, message: impl Into<String>) {
        self.events.log(self.id, message);
    }

    fn is_current(&self, worker: WorkerId) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|slot| slot.id() == worker)
    }

    /// Forks a worker, makes it current and waits until it is ready.
    ///
    /// A restart passes the worker it recovers in `recover` and is abandoned
    /// (returning `Ok(None)`) once the child was stopped or another worker
    /// has taken its place. A
    /// running worker displaced by the new one is retired unless it is
    /// `keep`, which the caller handles itself.
    async fn spawn_worker(
        self: &Arc<Self>,
        recover: Option<WorkerId>,
        keep: Option<WorkerId>,
    ) -> Result<Option<WorkerId>> {
        self.log("spawn worker command received");
        let Forked { worker, events } = self
            .launcher
            .fork(&self.command)
            .await
            .inspect_err(|e| self.log(format!("fork failed: {e}")))?;

        let slot = Slot::new(worker.clone());
        let displaced = {
            let mut current = self.current.lock();
            if let Some(recover) = recover
                && (self.halted.load(Ordering::SeqCst)
                    || !current.as_ref().is_some_and(|s| s.id() == recover))
            {
                drop(current);
                self.log(format!(
                    "restart abandoned, worker {recover} was stopped or replaced"
                ));
                self.retire_in_background(slot);
                return Ok(None);
            }
            let displaced = current.replace(slot.clone());
            self.set_state(ChildState::New);
            displaced
        };
        if let Some(displaced) = displaced.filter(|old| {
            Some(old.id()) != keep
                && !old.shutdown_requested()
                && old.worker.exit_status().is_none()
        }) {
            self.log(format!(
                "worker disconnecting, worker ID: {}",
                displaced.id()
            ));
            self.retire_in_background(displaced);
        }
        self.events.status(StatusEvent::spawn(self.id, slot.id()));

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(self.clone().watch(slot, events, ready_tx));
        self.await_ready(worker.as_ref(), ready_rx).await?;
        Ok(Some(worker.id()))
    }

    async fn await_ready(
        &self,
        worker: &dyn WorkerProcess,
        ready: oneshot::Receiver<()>,
    ) -> Result<()> {
        let id = worker.id();
        let timeout = self.options.timeout;
        let readiness = if timeout.is_zero() {
            Ok(ready.await)
        } else {
            time::timeout(timeout, ready).await
        };

        match readiness {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let status = worker
                    .exit_status()
                    .unwrap_or_else(|| ExitStatus::new(None, None, false));
                self.log(format!(
                    "worker exited before becoming ready, worker ID: {id} ({status})"
                ));
                return Err(Error::ExitedBeforeReady { worker: id, status });
            }
            Err(_) => {
                {
                    let current = self.current.lock();
                    if current.as_ref().is_some_and(|slot| slot.id() == id)
                        && self.state() == ChildState::New
                    {
                        self.set_state(ChildState::TimedOut);
                    }
                }
                self.log(format!("timeout forking the worker, worker ID: {id}"));
                return Err(Error::SpawnTimeout {
                    worker: id,
                    timeout,
                });
            }
        }

        time::sleep(self.options.confirm_delay).await;

        let current = self.current.lock();
        let still_current = current.as_ref().is_some_and(|slot| slot.id() == id);
        if worker.is_connected() && still_current && self.state() == ChildState::New {
            self.set_state(ChildState::Initialized);
            drop(current);
            self.log(format!("worker is ready, worker ID: {id}"));
            Ok(())
        } else {
            drop(current);
            self.log(format!(
                "worker went away before readiness was confirmed, worker ID: {id}"
            ));
            Err(Error::ConfirmFailed { worker: id })
        }
    }

    /// Drains one worker's events until it exits. Readiness resolves at
    /// most once; later ready messages are ignored.
    async fn watch(
        self: Arc<Self>,
        slot: Slot,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        ready: oneshot::Sender<()>,
    ) {
        let mut ready = Some(ready);
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Listening { address } => {
                    if self.options.ready_on == ReadyOn::Listening
                        && let Some(tx) = ready.take()
                    {
                        debug!(
                            child = %self.id,
                            "worker {} listening on {}",
                            slot.id(),
                            address.as_deref().unwrap_or("an unknown address")
                        );
                        let _ = tx.send(());
                    }
                }
                WorkerEvent::Message(message) => {
                    if self.options.ready_on == ReadyOn::Ready
                        && forkpool_ipc::is_ready_message(&message)
                        && let Some(tx) = ready.take()
                    {
                        let _ = tx.send(());
                    } else {
                        debug!(child = %self.id, "message from worker {}: {}", slot.id(), message);
                    }
                }
                WorkerEvent::Exit(status) => {
                    drop(ready.take());
                    self.on_exit(&slot, status);
                    return;
                }
            }
        }
        warn!(child = %self.id, "event stream of worker {} ended without an exit", slot.id());
    }

    fn on_exit(self: &Arc<Self>, slot: &Slot, status: ExitStatus) {
        let id = slot.id();
        self.events.status(StatusEvent::exit(self.id, id, &status));

        if slot.shutdown_requested() {
            self.log(format!("worker exited after disconnect, worker ID: {id} ({status})"));
            self.finish_stop(id);
            return;
        }

        {
            let current = self.current.lock();
            if !current.as_ref().is_some_and(|slot| slot.id() == id) {
                drop(current);
                self.log(format!("retired worker exited, worker ID: {id} ({status})"));
                return;
            }
            let state = self.state();
            if state != ChildState::Initialized {
                drop(current);
                self.log(format!(
                    "worker exited while {state}, worker ID: {id} ({status})"
                ));
                return;
            }
            self.set_state(ChildState::Died);
        }

        if status.is_crash() {
            self.log(format!("worker crashed, worker ID: {id} ({status})"));
            self.schedule_respawn(id);
        } else {
            self.log(format!("worker exited, worker ID: {id} ({status})"));
        }
    }

    /// Restarts `failed` after the backoff delay, as long as it is still the
    /// current worker by then.
    fn schedule_respawn(self: &Arc<Self>, failed: WorkerId) {
        if self.halted.load(Ordering::SeqCst) {
            return;
        }
        let delay = self.backoff.lock().schedule(self.clone().respawn(failed));
        self.log(format!("restarting worker in {delay:?}"));
    }

    fn respawn(self: Arc<Self>, failed: WorkerId) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.halted.load(Ordering::SeqCst) {
                self.log("restart cancelled, child was stopped");
                return;
            }
            if !self.is_current(failed) {
                self.log(format!(
                    "restart cancelled, worker {failed} was already replaced"
                ));
                return;
            }
            match self.spawn_worker(Some(failed), None).await {
                Ok(Some(_)) => {
                    self.backoff.lock().reset();
                    self.log("worker restarted");
                }
                Ok(None) => {}
                Err(err) if err.is_worker_loss() => {
                    error!(child = %self.id, "Restart failed: {}", err);
                    self.schedule_respawn(err.worker().unwrap_or(failed));
                }
                Err(err) => {
                    error!(child = %self.id, "Restart failed, giving up: {}", err);
                    self.log(format!("giving up on restarts: {err}"));
                }
            }
        })
    }

    fn begin_disconnect(&self) -> Option<Slot> {
        self.halted.store(true, Ordering::SeqCst);
        let slot = self.current.lock().clone()?;
        if !slot.worker.is_connected() {
            return None;
        }
        slot.request_shutdown();
        self.set_state(ChildState::Disconnecting);
        self.log(format!("worker disconnecting, worker ID: {}", slot.id()));
        Some(slot)
    }

    /// Asks a worker to leave and kills it if it is still around after the
    /// disconnect timeout.
    async fn retire(&self, worker: &Arc<dyn WorkerProcess>) {
        let id = worker.id();
        if let Err(e) = worker.disconnect().await {
            warn!(child = %self.id, "Failed to disconnect worker {}: {}", id, e);
        }
        if time::timeout(self.options.disconnect_timeout, worker.wait())
            .await
            .is_err()
        {
            self.log(format!("forced to kill worker, worker ID: {id}"));
            if let Err(e) = worker.kill().await {
                warn!(child = %self.id, "Failed to kill worker {}: {}", id, e);
            }
            worker.wait().await;
        }
    }

    fn finish_stop(&self, worker: WorkerId) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|slot| slot.id() == worker) {
            *current = None;
            self.set_state(ChildState::Stopped);
        }
    }

    /// Puts back the worker that was current before a failed replacement.
    fn reinstate(self: &Arc<Self>, previous: Slot, state: ChildState) {
        let failed = {
            let mut current = self.current.lock();
            let failed = current.replace(previous.clone());
            self.set_state(state);
            failed
        };
        self.log(format!(
            "keeping worker {} after failed replacement",
            previous.id()
        ));

        if let Some(failed) = failed.filter(|slot| slot.id() != previous.id()) {
            self.retire_in_background(failed);
        }
    }

    fn retire_in_background(self: &Arc<Self>, slot: Slot) {
        slot.request_shutdown();
        let retiring = self.clone();
        tokio::spawn(async move { retiring.retire(&slot.worker).await });
    }
}
