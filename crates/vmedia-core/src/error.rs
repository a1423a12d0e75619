//! Error taxonomy surfaced to bus callers.

use std::io;

/// Result type alias for mount-point operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the mount-point state machine and its RPC surface.
///
/// Each variant maps to an errno-family code carried by the bus error and
/// the `Completion` signal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// Unrecognized URL, malformed secret framing, comma in username.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Subprocess spawn failures.
    #[error("operation canceled: {0}")]
    OperationCanceled(String),

    /// Directory or filesystem creation failure, CIFS mount failure.
    #[error("I/O error: {message}")]
    Io { errno: i32, message: String },

    /// Subprocess exited while the activation was still in flight.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Event illegal in the current state; writes to read-only properties.
    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    /// Event unknown to the current state.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// RPC wait timed out.
    #[error("device or resource busy: {0}")]
    Busy(String),
}

impl Error {
    /// I/O failure with the default EIO code.
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io {
            errno: libc::EIO,
            message: message.into(),
        }
    }

    /// I/O failure carrying the OS errno when one is available.
    pub fn from_io(err: &io::Error, message: impl Into<String>) -> Self {
        Error::Io {
            errno: err.raw_os_error().unwrap_or(libc::EIO),
            message: format!("{}: {err}", message.into()),
        }
    }

    /// The errno-family code exposed on the bus.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::OperationCanceled(_) => libc::ECANCELED,
            Error::Io { errno, .. } => *errno,
            Error::ConnectionRefused(_) => libc::ECONNREFUSED,
            Error::NotPermitted(_) => libc::EPERM,
            Error::NotSupported(_) => libc::EOPNOTSUPP,
            Error::Busy(_) => libc::EBUSY,
        }
    }
}
