use std::fmt;

use serde::{Deserialize, Serialize};

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Ping,
    Pong,
    /// A trainer announces it finished and will not send any more requests.
    StopWorker { trainer_id: u32 },
    Ack,
    Disconnect,
}

/// The category of a request rejected by the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrKind {
    /// No handler is registered for the requested channel.
    UnknownChannel,
    /// The message could not be decoded or violates the format.
    Malformed,
    /// The addressed mini-batch or micro-batch scope does not exist.
    UnknownScope,
    /// A variable already holds a value of another kind in the addressed scope.
    TypeConflict,
    /// The handler failed while processing a well formed request.
    Handler,
    /// The server is shutting down.
    Stopped,
}

/// The payload of the `Err` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErr {
    pub kind: RemoteErrKind,
    pub detail: String,
}

impl RemoteErr {
    pub fn new(kind: RemoteErrKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for RemoteErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}
