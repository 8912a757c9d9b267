//! Codec error type.

use std::io;

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while framing packets over a transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Transport I/O failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// A packet or structure inside it was malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Packet header length smaller than the header itself.
    #[error("invalid packet header")]
    InvalidHeader,

    /// Packet larger than allowed.
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge {
        /// Packet size.
        size: usize,
        /// Limit in effect.
        max: usize,
    },

    /// The peer closed the transport.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The operation observed cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl CodecError {
    /// Whether the error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether retrying on a fresh connection may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::BrokenPipe
            ),
            Self::ConnectionClosed => true,
            _ => false,
        }
    }
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
