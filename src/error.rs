//! Error taxonomy
//!
//! - `DataError`: validation failures surfaced synchronously to the caller
//! - `TransportError`: backend failures surfaced through the operation result
//! - `LogError`: what a `DataStream::log` caller sees (either of the above)
//! - `NodeError`: node lifecycle failures; `LocalBackendLost` is unrecoverable
//!
//! Topology conditions (no parent link) are not errors and never show up here.

use crate::config::ConfigError;
use std::io::Error as IoError;

/// Validation error raised before any state is touched
#[derive(Debug, Clone, PartialEq)]
pub enum DataError {
    /// Entry type does not match the type locked by the first write
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    /// Windowed read with a non-positive count
    InvalidCount(i64),
    /// Clock spec is not `c`, `c.f` or `c.*`
    InvalidClockSpec(String),
    /// Domain key could not be built or parsed
    InvalidDomainKey(String),
    /// Value is neither a number nor a string
    UnsupportedValue(String),
}

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataError::TypeMismatch { expected, actual } => write!(
                f,
                "Only data of type {} is allowed (got {})",
                expected, actual
            ),
            DataError::InvalidCount(n) => write!(f, "N must be a positive integer (got {})", n),
            DataError::InvalidClockSpec(spec) => write!(f, "Invalid clock spec: {}", spec),
            DataError::InvalidDomainKey(msg) => write!(f, "Invalid domain key: {}", msg),
            DataError::UnsupportedValue(msg) => write!(f, "Unsupported value: {}", msg),
        }
    }
}

impl std::error::Error for DataError {}

/// Backend/transport failure
#[derive(Debug)]
pub enum TransportError {
    /// Socket level I/O error
    Io(IoError),
    /// Malformed or unexpected RESP frame
    Protocol(String),
    /// Error reply from the server (`-ERR ...`)
    Server(String),
    /// Payload could not be encoded or decoded
    Codec(String),
    /// Connection or actor is gone
    Closed,
    /// Pending batched write was dropped before flushing
    Cancelled,
    /// Backend could not be reached at all
    Unreachable { host: String, port: u16 },
    /// Gave up waiting for the backend to reach a state
    Timeout(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            TransportError::Server(msg) => write!(f, "server error: {}", msg),
            TransportError::Codec(msg) => write!(f, "codec error: {}", msg),
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Cancelled => write!(f, "pending write cancelled"),
            TransportError::Unreachable { host, port } => {
                write!(f, "backend unreachable at {}:{}", host, port)
            }
            TransportError::Timeout(what) => write!(f, "timed out waiting for {}", what),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<IoError> for TransportError {
    fn from(e: IoError) -> Self {
        TransportError::Io(e)
    }
}

impl TransportError {
    /// Cheap copy for fanning one batch failure out to every waiter
    pub fn duplicate(&self) -> Self {
        match self {
            TransportError::Io(e) => TransportError::Io(IoError::new(e.kind(), e.to_string())),
            TransportError::Protocol(m) => TransportError::Protocol(m.clone()),
            TransportError::Server(m) => TransportError::Server(m.clone()),
            TransportError::Codec(m) => TransportError::Codec(m.clone()),
            TransportError::Closed => TransportError::Closed,
            TransportError::Cancelled => TransportError::Cancelled,
            TransportError::Unreachable { host, port } => TransportError::Unreachable {
                host: host.clone(),
                port: *port,
            },
            TransportError::Timeout(m) => TransportError::Timeout(m.clone()),
        }
    }
}

/// Failure of a `log` call
#[derive(Debug)]
pub enum LogError {
    Validation(DataError),
    Transport(TransportError),
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Validation(e) => write!(f, "{}", e),
            LogError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LogError {}

impl From<DataError> for LogError {
    fn from(e: DataError) -> Self {
        LogError::Validation(e)
    }
}

impl From<TransportError> for LogError {
    fn from(e: TransportError) -> Self {
        LogError::Transport(e)
    }
}

/// Node lifecycle error
#[derive(Debug)]
pub enum NodeError {
    Config(ConfigError),
    Transport(TransportError),
    /// Local backend connection dropped; the process cannot continue
    LocalBackendLost,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Config(e) => write!(f, "configuration error: {}", e),
            NodeError::Transport(e) => write!(f, "{}", e),
            NodeError::LocalBackendLost => write!(f, "local backend connection lost"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        NodeError::Config(e)
    }
}

impl From<TransportError> for NodeError {
    fn from(e: TransportError) -> Self {
        NodeError::Transport(e)
    }
}
