use std::{error::Error, fmt, io, time::Duration};

use comms::specs::{RemoteErr, RemoteErrKind};

use crate::{device::DeviceErr, task_queue::QueueErr};

/// The heter module's result type.
pub type Result<T> = std::result::Result<T, HeterErr>;

/// Failures of the heterogeneous send and receive subsystem.
#[derive(Debug)]
pub enum HeterErr {
    /// The message was rejected by the codec or by the remote end, never retried.
    Protocol { kind: RemoteErrKind, detail: String },
    /// Connection level failure that persisted through every retry.
    Transient {
        endpoint: String,
        attempts: usize,
        source: io::Error,
    },
    /// An operation did not complete within its deadline.
    Timeout { what: String, after: Duration },
    /// Invalid setup: missing endpoint, duplicate registration, bind failure.
    Config(String),
    /// The server was stopped.
    Stopped,
    Queue(QueueErr),
    Device(DeviceErr),
    /// The execution collaborator failed to run a follow-up operator.
    Execution(String),
    Io(io::Error),
}

impl HeterErr {
    /// Creates a protocol error.
    pub fn protocol(kind: RemoteErrKind, detail: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            detail: detail.into(),
        }
    }

    /// Creates a protocol error for a malformed message.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::protocol(RemoteErrKind::Malformed, detail)
    }

    /// Whether retrying the same request at a higher level may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Converts this error into the reply sent back to the requesting peer.
    pub fn to_remote(&self) -> RemoteErr {
        match self {
            Self::Protocol { kind, detail } => RemoteErr::new(*kind, detail.clone()),
            Self::Stopped => RemoteErr::new(RemoteErrKind::Stopped, self.to_string()),
            other => RemoteErr::new(RemoteErrKind::Handler, other.to_string()),
        }
    }
}

impl fmt::Display for HeterErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { kind, detail } => write!(f, "protocol error ({kind:?}): {detail}"),
            Self::Transient {
                endpoint,
                attempts,
                source,
            } => write!(
                f,
                "transient failure talking to {endpoint} after {attempts} attempt(s): {source}"
            ),
            Self::Timeout { what, after } => write!(f, "{what} timed out after {after:?}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Stopped => f.write_str("the server is stopped"),
            Self::Queue(e) => write!(f, "task queue error: {e}"),
            Self::Device(e) => write!(f, "device error: {e}"),
            Self::Execution(msg) => write!(f, "execution error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for HeterErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transient { source, .. } => Some(source),
            Self::Queue(e) => Some(e),
            Self::Device(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HeterErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<QueueErr> for HeterErr {
    fn from(value: QueueErr) -> Self {
        Self::Queue(value)
    }
}

impl From<DeviceErr> for HeterErr {
    fn from(value: DeviceErr) -> Self {
        Self::Device(value)
    }
}

impl From<RemoteErr> for HeterErr {
    fn from(value: RemoteErr) -> Self {
        Self::Protocol {
            kind: value.kind,
            detail: value.detail,
        }
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<HeterErr> for io::Error {
    fn from(value: HeterErr) -> Self {
        match value {
            HeterErr::Io(e) => e,
            HeterErr::Transient { source, .. } => source,
            HeterErr::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, value),
            HeterErr::Protocol { .. } => io::Error::new(io::ErrorKind::InvalidData, value),
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_failures_are_transient() {
        let transient = HeterErr::Transient {
            endpoint: "127.0.0.1:1".into(),
            attempts: 3,
            source: io::ErrorKind::ConnectionRefused.into(),
        };

        assert!(transient.is_transient());
        assert!(!HeterErr::malformed("bad").is_transient());
        assert!(!HeterErr::Stopped.is_transient());
    }

    #[test]
    fn test_remote_errors_keep_their_kind() {
        let err = HeterErr::from(RemoteErr::new(RemoteErrKind::UnknownChannel, "y"));
        assert_eq!(err.to_remote().kind, RemoteErrKind::UnknownChannel);

        let err = HeterErr::Execution("boom".into());
        assert_eq!(err.to_remote().kind, RemoteErrKind::Handler);
    }
}
