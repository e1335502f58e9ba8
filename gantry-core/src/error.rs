//! Gantry Error Types
//!
//! Every failure the engine reports to a delegate is one of these. The enum is
//! `Clone` because one terminating error is handed to the close notification
//! and, at the same time, may be the cause recorded for queued operations.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Gantry operations
#[derive(Error, Debug, Clone)]
pub enum GantryError {
    /// Invalid configuration or parameter (e.g. binding after connecting)
    #[error("Bad configuration: {0}")]
    Config(String),

    /// A hostname produced no usable address
    #[error("Unable to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// Connect attempt exceeded its deadline
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Read operation exceeded its deadline
    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// Write operation exceeded its deadline
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Datagram send exceeded its deadline
    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),

    /// Delimiter read scanned its maximum length without a match
    #[error("Read maxed out: no delimiter within {max} bytes")]
    ReadMaxedOut { max: usize },

    /// Remote peer closed the connection
    #[error("Socket closed by remote peer")]
    PeerClosed,

    /// The socket was closed before the operation could finish
    #[error("Socket closed")]
    Closed,

    /// TLS handshake or record-layer failure
    #[error("Security error: {0}")]
    Security(String),

    /// OS-level failure not otherwise classified
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Anything else, with a description
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Gantry operations
pub type Result<T> = std::result::Result<T, GantryError>;

impl From<io::Error> for GantryError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl GantryError {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a security error with a message
    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    /// Create a resolution error for `host`
    pub fn resolve(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a generic error with a description
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is one of the timeout kinds
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_)
                | Self::ReadTimeout(_)
                | Self::WriteTimeout(_)
                | Self::SendTimeout(_)
        )
    }

    /// Check if this is a connection-level error.
    ///
    /// Connection-level errors always take the whole socket down; the rest
    /// only fail the operation that hit them.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::PeerClosed | Self::Closed | Self::Security(_) | Self::ConnectTimeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// The underlying `io::ErrorKind`, if this wraps an OS error
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}
