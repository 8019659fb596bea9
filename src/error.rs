//! Error type shared by the server and connection layers.

use std::net::{AddrParseError, SocketAddr};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the server, connections and event dispatch.
#[derive(Debug)]
pub enum Error {
    /// Bind address could not be parsed.
    InvalidAddress(String, AddrParseError),
    /// Port outside 0-65535.
    PortOutOfRange(u32),
    /// Binding or listening on the local endpoint failed.
    Bind(SocketAddr, std::io::Error),
    /// Called outside of a tokio runtime.
    NoRuntime,
    /// Socket read/write fault.
    Io(std::io::Error),
    /// A caller-supplied handler panicked.
    Handler(String),
}

impl Error {
    /// Whether this error means the peer is gone rather than a transient fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => is_disconnect(e),
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidAddress(addr, e) => write!(f, "Invalid address '{}': {}", addr, e),
            Error::PortOutOfRange(port) => {
                write!(f, "Port {} is outside the valid range 0-65535", port)
            }
            Error::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            Error::NoRuntime => write!(f, "No tokio runtime is running on this thread"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Handler(msg) => write!(f, "Handler panicked: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidAddress(_, e) => Some(e),
            Error::Bind(_, e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Error kinds that mean the remote side went away. Graceful close and
/// reset are not distinguished.
pub(crate) fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}
