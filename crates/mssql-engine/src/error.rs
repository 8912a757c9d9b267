//! Engine error types.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mssql_codec::CodecError;
use mssql_tls::TlsError;
use tds_protocol::ProtocolError;
use tds_protocol::token::ServerMessage;
use thiserror::Error;

use crate::datasource::Protocol;

/// Errors that can occur while connecting or running the token stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport could not be established or failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The byte stream could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Pre-login negotiation failed.
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// TLS handshake or configuration failed.
    #[error("TLS error: {0}")]
    Tls(TlsError),

    /// The server reported errors or warnings for the unit of work.
    #[error("{0}")]
    Server(ServerErrors),

    /// The operation observed cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// A rate limiter is inside a blocking period.
    #[error("blocked by rate limiter, retry after {retry_after:?}")]
    Blocked {
        /// Time left in the blocking period.
        retry_after: Duration,
    },

    /// Invalid configuration or data source.
    #[error("configuration error: {0}")]
    Config(String),

    /// A fatal error or broken stream left the session unusable.
    #[error("session is broken and cannot run further operations")]
    SessionBroken,

    /// A sync-mode operation tried to suspend.
    #[error("sync-mode operation would block on an async resource")]
    SyncSuspended,
}

impl Error {
    /// Whether the error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether retrying on a fresh connection may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_transient(),
            Self::Blocked { .. } => true,
            _ => false,
        }
    }

    /// Whether the error means the byte stream can no longer be trusted.
    ///
    /// Protocol errors indicate desynchronization or a driver bug and must
    /// abort the session rather than be retried in place.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Negotiation(_))
    }

    /// The consolidated server messages, if this is a server error.
    #[must_use]
    pub fn server_errors(&self) -> Option<&ServerErrors> {
        match self {
            Self::Server(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Cancelled => Self::Cancelled,
            CodecError::Io(e) => Self::Transport(TransportError::Socket(e)),
            CodecError::ConnectionClosed => Self::Transport(TransportError::ConnectionClosed),
            CodecError::Protocol(e) => Self::Protocol(e),
            other => Self::Transport(TransportError::Framing(other.to_string())),
        }
    }
}

impl From<TlsError> for Error {
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::Cancelled => Self::Cancelled,
            other => Self::Tls(other),
        }
    }
}

/// Failures establishing or using the byte transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Host name resolution failed.
    #[error("failed to resolve '{host}': {source}")]
    Resolve {
        /// Host being resolved.
        host: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but returned no addresses.
    #[error("no addresses found for '{0}'")]
    NoAddresses(String),

    /// A single socket-level failure.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// Every candidate failed, with differing causes.
    #[error("{}", format_attempts(.0))]
    Aggregate(Vec<ConnectAttempt>),

    /// No handler in the chain accepted the resolved protocol.
    #[error("no transport handler for protocol {0:?}")]
    NoHandler(Protocol),

    /// The peer closed the transport.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Packet framing failed.
    #[error("framing error: {0}")]
    Framing(String),
}

impl TransportError {
    /// Whether retrying may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Socket(e) => is_transient_kind(e.kind()),
            Self::Aggregate(attempts) => attempts.iter().any(|a| is_transient_kind(a.error.kind())),
            Self::Resolve { .. } | Self::ConnectionClosed => true,
            _ => false,
        }
    }
}

fn is_transient_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
    )
}

fn format_attempts(attempts: &[ConnectAttempt]) -> String {
    let details: Vec<String> = attempts.iter().map(ToString::to_string).collect();
    format!(
        "all {} connection attempts failed: {}",
        attempts.len(),
        details.join("; ")
    )
}

/// One failed connection attempt.
#[derive(Debug)]
pub struct ConnectAttempt {
    /// Address tried.
    pub addr: SocketAddr,
    /// Why it failed.
    pub error: io::Error,
}

impl fmt::Display for ConnectAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.addr, self.error)
    }
}

/// Pre-login negotiation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NegotiationError {
    /// The client requires encryption the server cannot provide.
    #[error("the server does not support encryption")]
    EncryptionNotSupportedByServer,

    /// The server requires encryption the client cannot provide.
    #[error("the server requires encryption, which is not supported by the client")]
    EncryptionNotSupportedByClient,

    /// The server rejected the requested instance.
    #[error("instance name mismatch reported by server")]
    InstanceMismatch,

    /// The server's pre-login response was unusable.
    #[error("invalid pre-login response: {0}")]
    InvalidResponse(String),

    /// The login response did not contain a login acknowledgment.
    #[error("login was not acknowledged by the server")]
    LoginNotAcknowledged,
}

/// The ordered server errors and warnings for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerErrors {
    messages: Vec<ServerMessage>,
}

impl ServerErrors {
    /// Wrap an ordered collection.
    #[must_use]
    pub fn new(messages: Vec<ServerMessage>) -> Self {
        Self { messages }
    }

    /// All messages, in reporting order.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    /// Messages at error severity.
    pub fn errors(&self) -> impl Iterator<Item = &ServerMessage> {
        self.messages.iter().filter(|m| m.is_error())
    }

    /// Messages below error severity.
    pub fn warnings(&self) -> impl Iterator<Item = &ServerMessage> {
        self.messages.iter().filter(|m| !m.is_error())
    }

    /// Whether any message terminated the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.messages.iter().any(ServerMessage::is_fatal)
    }

    /// Whether a message with `number` was reported.
    #[must_use]
    pub fn contains(&self, number: i32) -> bool {
        self.messages.iter().any(|m| m.number == number)
    }
}

impl fmt::Display for ServerErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.messages.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", m.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerErrors {}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
