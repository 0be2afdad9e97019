use crate::{CHANNEL_ENV, ControlMessage, WORKER_ID_ENV, read_frame, write_frame};
use forkpool_core::{Error, Result, WorkerId};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};

/// Supervisor end: one listening socket per forked worker.
pub struct ChannelListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ChannelListener {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Worker end of the channel.
///
/// Dropping it closes the connection, which the supervisor reads as the
/// worker disconnecting.
#[derive(Debug)]
pub struct WorkerChannel {
    stream: UnixStream,
    worker_id: Option<WorkerId>,
}

impl WorkerChannel {
    /// Connects to the supervisor named in the environment. Fails with
    /// [`Error::NotForked`] when the process was not started by a launcher.
    pub async fn connect() -> Result<Self> {
        let path = std::env::var_os(CHANNEL_ENV).ok_or(Error::NotForked)?;
        let worker_id = std::env::var(WORKER_ID_ENV)
            .ok()
            .and_then(|id| id.parse().ok())
            .map(WorkerId::new);
        let mut channel = Self::connect_to(path).await?;
        channel.worker_id = worker_id;
        Ok(channel)
    }

    pub async fn connect_to(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await.map_err(|e| {
            Error::Channel(format!(
                "cannot reach supervisor at {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self {
            stream,
            worker_id: None,
        })
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    pub async fn send(&mut self, message: &serde_json::Value) -> Result<()> {
        write_frame(&mut self.stream, message).await
    }

    /// Sends `{"cmd": "ready"}`.
    pub async fn ready(&mut self) -> Result<()> {
        self.send(&ControlMessage::Ready.to_value()).await
    }

    /// Tells the supervisor a network listener is open.
    pub async fn listening(&mut self, address: SocketAddr) -> Result<()> {
        let message = ControlMessage::Listening {
            address: Some(address.to_string()),
        };
        self.send(&message.to_value()).await
    }

    /// Next message from the supervisor, `None` once it closed the channel.
    pub async fn recv(&mut self) -> Result<Option<serde_json::Value>> {
        read_frame(&mut self.stream).await
    }

    /// Waits until the supervisor asks for a shutdown or goes away.
    pub async fn disconnected(&mut self) -> Result<()> {
        while let Some(message) = self.recv().await? {
            if ControlMessage::parse(&message) == Some(ControlMessage::Disconnect) {
                tracing::debug!("supervisor requested disconnect");
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Connects to the supervisor and reports the worker as ready.
///
/// Keep the returned channel alive: dropping it disconnects the worker.
pub async fn ready() -> Result<WorkerChannel> {
    let mut channel = WorkerChannel::connect().await?;
    channel.ready().await?;
    Ok(channel)
}
