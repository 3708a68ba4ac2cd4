use std::path::PathBuf;
use std::time::Duration;

/// Errors raised by companion endpoints.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint address could not be bound.
    #[error("failed to bind endpoint {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Connecting to a bound endpoint failed.
    #[error("failed to connect to endpoint {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Accepting the companion connection failed.
    #[error("failed to accept companion connection: {0}")]
    Accept(std::io::Error),

    /// No companion attached before the deadline.
    #[error("no companion attached to {path} within {timeout:?}")]
    AttachTimeout { path: PathBuf, timeout: Duration },

    /// An I/O error occurred on an established stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint path does not fit into `sockaddr_un`.
    #[error("endpoint path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The stream was shut down locally.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
