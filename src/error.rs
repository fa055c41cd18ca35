//! Error types shared across the socket layer, the protocol registry and
//! server startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by [`crate::net::NetSocket`] and the static socket helpers.
///
/// Every variant that wraps an OS failure also leaves the raw errno in
/// `NetSocket::last_error`, so callers that only care about the code can
/// ignore the payload.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket is not open")]
    NotOpen,
    #[error("socket is already open")]
    AlreadyOpen,
    #[error("socket is not listening")]
    NotListening,
    #[error("path {} exists and is not a socket", path.display())]
    NotSocket { path: PathBuf },
    #[error("socket {} is already in use", path.display())]
    InUse { path: PathBuf },
    #[error("invalid socket target '{0}'")]
    InvalidTarget(String),
    #[error("unable to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("{op} failed for {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    /// errno-compatible code for this error.
    pub fn errno(&self) -> i32 {
        match self {
            SocketError::NotOpen => libc::EBADF,
            SocketError::AlreadyOpen => libc::EBUSY,
            SocketError::NotListening => libc::EINVAL,
            SocketError::NotSocket { .. } => libc::ENOTSOCK,
            SocketError::InUse { .. } => libc::EADDRINUSE,
            SocketError::InvalidTarget(_) => libc::EINVAL,
            SocketError::Resolve { source, .. } | SocketError::Io { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }
}

/// Fatal errors raised while resolving and binding protocols at startup.
///
/// Any of these terminates the service before it accepts traffic.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no protocols configured")]
    NoProtocols,
    #[error("protocol '{0}' is not registered")]
    UnknownProtocol(String),
    #[error("protocol '{name}' rejected its port assignment")]
    Port { name: String },
    #[error("protocol '{name}' could not be loaded")]
    Factory { name: String },
    #[error("unable to bind protocol '{name}': {source}")]
    Bind {
        name: String,
        #[source]
        source: SocketError,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}
