//! Live protocol state of one session.

use std::fmt;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use mssql_codec::TdsStream;
use tds_protocol::token::{
    DataClassification, DecodeContext, FeatureExtAck, FedAuthInfo, LoginAck, ServerMessage,
    TokenType,
};

use super::errors::ErrorWarningsState;
use super::reader::TokenReader;

bitflags! {
    /// How the run loop drains the stream and reports errors.
    ///
    /// `CLEAN` and `ATTENTION` are composites that include `UNTIL_DONE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RunBehavior: u8 {
        /// Read until the current response message ends.
        const UNTIL_DONE = 0x01;
        /// Return after one token.
        const RETURN_IMMEDIATELY = 0x02;
        /// Drain and discard accumulated errors and warnings.
        const CLEAN = 0x05;
        /// Cancel the running request and drain up to its acknowledgment.
        const ATTENTION = 0x0D;
    }
}

/// Parser lifecycle.
///
/// ```text
/// Closed -> OpenNotLoggedIn -> OpenLoggedIn
///              \                  /
///               +---> Broken <---+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserState {
    /// No stream attached.
    Closed,
    /// Stream open, login not acknowledged yet.
    OpenNotLoggedIn,
    /// Login acknowledged.
    OpenLoggedIn,
    /// A fatal error or stream failure; the session cannot be reused.
    Broken,
}

impl ParserState {
    /// Whether the session can run another unit of work.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::OpenNotLoggedIn | Self::OpenLoggedIn)
    }
}

/// Callback receiving informational messages.
pub type InfoListener = Box<dyn FnMut(&ServerMessage) + Send>;

/// Routing target announced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
}

/// Completion of one statement, as reported by a DONE-family token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementResult {
    /// DONE, DONEPROC or DONEINPROC.
    pub token: TokenType,
    /// Affected rows, if the server marked the count valid.
    pub rows: Option<u64>,
}

/// Values the server announced for this session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Login acknowledgment.
    pub login_ack: Option<LoginAck>,
    /// Acknowledged feature extensions.
    pub features: Option<FeatureExtAck>,
    /// Federated authentication endpoints.
    pub fed_auth_info: Option<FedAuthInfo>,
    /// Classification of the current result set.
    pub data_classification: Option<DataClassification>,
    /// Current database.
    pub database: Option<String>,
    /// Current language.
    pub language: Option<String>,
    /// Current collation, raw.
    pub collation: Option<Bytes>,
    /// Routing redirect.
    pub routing: Option<Routing>,
    /// Active transaction descriptor, 0 outside a transaction.
    pub transaction_descriptor: u64,
    /// Return status of the last procedure.
    pub return_status: Option<i32>,
    /// Column ordering of the current result set.
    pub order: Vec<u16>,
    /// Session state blobs received since login.
    pub session_state: Vec<Bytes>,
    /// Last SSPI challenge.
    pub sspi: Option<Bytes>,
    /// Statement completions, in receipt order.
    pub statement_results: Vec<StatementResult>,
    /// Whether the last attention was acknowledged.
    pub attention_acknowledged: bool,
}

/// Session state mutated by token processors.
pub struct TdsContext {
    pub(crate) stream: TdsStream,
    pub(crate) reader: TokenReader,
    pub(crate) decode: DecodeContext,
    pub(crate) state: ParserState,
    pub(crate) errors: ErrorWarningsState,
    pub(crate) session: SessionInfo,
    pub(crate) deadline: Option<Instant>,
    pub(crate) info_listener: Option<InfoListener>,
}

impl TdsContext {
    /// Attach a context to an open stream.
    #[must_use]
    pub fn new(stream: TdsStream, decode: DecodeContext) -> Self {
        Self {
            stream,
            reader: TokenReader::default(),
            decode,
            state: ParserState::OpenNotLoggedIn,
            errors: ErrorWarningsState::default(),
            session: SessionInfo::default(),
            deadline: None,
            info_listener: None,
        }
    }

    /// Current parser state.
    #[must_use]
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Values that change token layout.
    #[must_use]
    pub fn decode_context(&self) -> &DecodeContext {
        &self.decode
    }

    /// Values the server announced.
    #[must_use]
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Accumulated errors and warnings.
    #[must_use]
    pub fn errors(&self) -> &ErrorWarningsState {
        &self.errors
    }

    /// Mutable access to accumulated errors and warnings.
    pub fn errors_mut(&mut self) -> &mut ErrorWarningsState {
        &mut self.errors
    }

    /// The packet stream.
    pub fn stream_mut(&mut self) -> &mut TdsStream {
        &mut self.stream
    }

    /// Register a callback for informational messages.
    pub fn set_info_listener(&mut self, listener: impl FnMut(&ServerMessage) + Send + 'static) {
        self.info_listener = Some(Box::new(listener));
    }

    /// Remove the informational message callback.
    pub fn clear_info_listener(&mut self) {
        self.info_listener = None;
    }

    /// Start (or clear) the timeout for the next unit of work.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.deadline = timeout.map(|t| Instant::now() + t);
    }

    /// Whether the current timeout has expired.
    #[must_use]
    pub fn timeout_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether bytes of the current response remain to be processed.
    #[must_use]
    pub fn has_pending_data(&self) -> bool {
        self.reader.has_buffered() || self.stream.has_pending_data()
    }

    /// Mark the session broken.
    pub fn mark_broken(&mut self) {
        if self.state != ParserState::Broken {
            tracing::debug!(from = ?self.state, "session marked broken");
        }
        self.state = ParserState::Broken;
    }

    /// Close the session, returning its stream.
    #[must_use]
    pub fn close(mut self) -> TdsStream {
        self.state = ParserState::Closed;
        self.reader.clear();
        self.stream
    }
}

impl fmt::Debug for TdsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TdsContext")
            .field("state", &self.state)
            .field("tds_version", &self.decode.tds_version)
            .field("errors", &self.errors)
            .field("deadline", &self.deadline)
            .field("has_info_listener", &self.info_listener.is_some())
            .finish_non_exhaustive()
    }
}
