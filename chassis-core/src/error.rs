//! Chassis Error Types
//!
//! Error handling for the transport layer. Native failures coming from the
//! message-queue socket or the poll primitive stay `io::Error` values built
//! from raw errno codes; everything the caller got wrong is reported through
//! the dedicated variants below.

use std::io;
use thiserror::Error;

use crate::endpoint::EndpointError;

/// Main error type for Chassis transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Native error reported by the socket or the poll primitive
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed endpoint string
    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// Operation not available for this socket type
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Usage error: the call is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Usage error: an argument has an unacceptable value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The transport has been closed
    #[error("Transport closed")]
    Closed,
}

/// Result type alias for Chassis transport operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a not-supported error with a message
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create an invalid-state error with a message
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid-argument error with a message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Native errno carried by this error, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Check if this error is a retryable native condition
    /// (would-block or interrupt).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => is_retryable(e),
            _ => false,
        }
    }

    /// Check if this is a usage error raised synchronously to the caller
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NotSupported(_) | Self::InvalidState(_) | Self::InvalidArgument(_) | Self::Endpoint(_)
        )
    }
}

/// Build a native error from an errno value.
#[must_use]
pub fn native(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// Would-block and interrupt are the only native conditions that never
/// escalate to a fatal transport error.
#[must_use]
pub fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
