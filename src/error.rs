//! Error types shared across the crate.
//!
//! The taxonomy distinguishes conditions the caller reacts to differently:
//! peer disconnects (`EndOfStream`, `ClosedSocket`) terminate a connection
//! quietly, `DataFormat` additionally produces a 400 or a Close(1002)
//! depending on phase, and `Internal` marks library bugs. "Incomplete" is
//! deliberately not an error: codec-level reads report an incomplete unit
//! as `Ok(None)` and the transport simply reads more.

use std::io;
use thiserror::Error;

/// Errors produced by the handshake, framing, and connection layers.
#[derive(Debug, Error)]
pub enum SockError {
    /// The peer shut the stream down cleanly in the middle of a unit.
    #[error("end of stream")]
    EndOfStream,

    /// An operation was attempted on a connection that is already closed
    /// on our side.
    #[error("stream already closed")]
    ClosedStream,

    /// The peer dropped the socket (connection reset, broken pipe).
    #[error("socket closed by peer")]
    ClosedSocket,

    /// Any other socket-level failure, including single-operation
    /// timeouts.
    #[error("socket error: {0}")]
    Socket(io::Error),

    /// Malformed handshake text or frame bytes.
    #[error("malformed data: {0}")]
    DataFormat(String),

    /// A library invariant was violated. Always a bug, never peer input.
    #[error("internal error: {0}")]
    Internal(String),

    /// Well-formed input the library does not support (binary frames).
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A handshake or frame larger than the configured receive limit.
    #[error("unit of {size} bytes exceeds limit of {max} bytes")]
    Oversize {
        /// Observed (or declared) size of the unit.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Cooperative cancellation was requested while the operation ran.
    #[error("cancellation requested")]
    Cancelled,

    /// A failure that fits no other category.
    #[error("unknown error")]
    Unknown,
}

impl SockError {
    /// True for conditions caused by the peer going away, which are
    /// logged as warnings rather than errors.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::ClosedSocket)
    }

    /// True when the failure is a library bug rather than peer behavior.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Unknown)
    }

    /// Builds a `Socket` error carrying an OS-level timeout, used when a
    /// bounded read or write exceeds its deadline.
    #[must_use]
    pub fn timed_out(what: &str) -> Self {
        Self::Socket(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
    }
}

impl From<io::Error> for SockError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::ClosedSocket,
            _ => Self::Socket(err),
        }
    }
}
