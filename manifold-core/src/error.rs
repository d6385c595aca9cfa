//! Error types for manifold operations.

use std::io;
use thiserror::Error;

/// Main error type for manifold operations.
#[derive(Error, Debug)]
pub enum ManifoldError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Endpoint could not be resolved to a usable address
    #[error("unable to resolve endpoint: {host}")]
    Resolve {
        /// The hostname that failed to resolve
        host: String,
    },

    /// Endpoint string could not be parsed
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The socket manager has been disposed
    #[error("socket manager disposed")]
    Disposed,

    /// The bridge declined the connection in `connected`
    #[error("connection rejected by bridge")]
    ConnectionRejected,
}

/// Result type alias for manifold operations
pub type Result<T> = std::result::Result<T, ManifoldError>;

impl ManifoldError {
    /// Create a resolution error for a hostname
    pub fn resolve(host: impl Into<String>) -> Self {
        Self::Resolve { host: host.into() }
    }

    /// Create an invalid-endpoint error with a message
    pub fn invalid_endpoint(msg: impl Into<String>) -> Self {
        Self::InvalidEndpoint(msg.into())
    }

    /// Check if this error indicates the connection itself is unusable
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Resolve { .. } | Self::ConnectionRejected
        )
    }

    /// Check if this error is recoverable by retrying the operation
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Disposed => false,
            _ => false,
        }
    }
}
