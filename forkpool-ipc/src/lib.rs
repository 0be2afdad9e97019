//! Channel between a supervisor and the workers it forks.
//!
//! Every frame is a big-endian `u32` length followed by one JSON document.
//! The supervisor passes the socket path to the worker in
//! [`CHANNEL_ENV`]; the worker connects once and keeps the connection open
//! for as long as it wants to be considered connected.

mod codec;
#[cfg(unix)]
mod unix;

pub use codec::{MAX_FRAME_LEN, read_frame, write_frame};
#[cfg(unix)]
pub use unix::{ChannelListener, WorkerChannel, ready};

use serde::{Deserialize, Serialize};

/// Environment variable holding the channel socket path.
pub const CHANNEL_ENV: &str = "FORKPOOL_CHANNEL";

/// Environment variable holding the worker id assigned by the launcher.
pub const WORKER_ID_ENV: &str = "FORKPOOL_WORKER_ID";

/// Control messages understood by both ends. Anything else on the channel is
/// an application message and is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Worker to supervisor: initialization finished.
    Ready,
    /// Worker to supervisor: a network listener is open.
    Listening {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// Supervisor to worker: shut down gracefully.
    Disconnect,
}

impl ControlMessage {
    /// Recognizes a control message, ignoring any extra fields.
    pub fn parse(value: &serde_json::Value) -> Option<Self> {
        value.get("cmd")?.as_str()?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Null)
    }
}

/// True for the `{"cmd": "ready"}` message.
pub fn is_ready_message(value: &serde_json::Value) -> bool {
    value.get("cmd").and_then(|cmd| cmd.as_str()) == Some("ready")
}
