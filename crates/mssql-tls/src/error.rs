//! TLS-related error types.

use mssql_codec::CodecError;
use thiserror::Error;

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The target host is not a valid TLS server name.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// Invalid certificate format.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// IO error during TLS operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rustls error.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// Connection closed during TLS negotiation.
    #[error("connection closed during TLS negotiation")]
    ConnectionClosed,

    /// The handshake observed cancellation.
    #[error("TLS handshake cancelled")]
    Cancelled,
}

impl From<CodecError> for TlsError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => Self::Io(e),
            CodecError::Cancelled => Self::Cancelled,
            CodecError::ConnectionClosed => Self::ConnectionClosed,
            other => Self::HandshakeFailed(other.to_string()),
        }
    }
}

/// Result type for TLS operations.
pub type Result<T> = std::result::Result<T, TlsError>;
