/// Gangway Error Types
///
/// Error handling for all gangway operations.

use std::io;
use thiserror::Error;

/// Main error type for gangway operations
#[derive(Error, Debug)]
pub enum GangwayError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection-level operation attempted with no established connection
    #[error("Not connected")]
    NotConnected,

    /// Process was called while a worker thread is already running
    #[error("Already processing")]
    AlreadyProcessing,

    /// Open or connect was called on an instance that is already open
    #[error("Already open")]
    AlreadyOpen,

    /// Operation requires an endpoint mode it was not opened in
    #[error("Operation {operation} not supported in {mode} mode")]
    UnsupportedMode {
        mode: &'static str,
        operation: &'static str,
    },

    /// Host name did not resolve to an IPv4 address
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// The connection or endpoint has been closed
    #[error("Closed")]
    Closed,
}

/// Result type alias for gangway operations
pub type Result<T> = std::result::Result<T, GangwayError>;

impl GangwayError {
    /// Create an unsupported-mode error
    pub const fn unsupported_mode(mode: &'static str, operation: &'static str) -> Self {
        Self::UnsupportedMode { mode, operation }
    }

    /// Create a host-not-found error
    pub fn host_not_found(host: impl Into<String>) -> Self {
        Self::HostNotFound(host.into())
    }

    /// Check if this error reflects incorrect API usage rather than an
    /// environmental failure
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::AlreadyProcessing
                | Self::AlreadyOpen
                | Self::UnsupportedMode { .. }
                | Self::Closed
        )
    }

    /// Check if this error is transient at the socket level
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
