//! # mssql-engine
//!
//! TDS protocol engine: connection establishment, the token run loop and
//! rate limiting.
//!
//! ## Components
//!
//! - **Connection pipeline**: data source parsing, a transport chain (TCP,
//!   named pipe, shared memory), pre-login and TLS negotiation (TDS 7.4 and
//!   TDS 8.0) and LOGIN7, composed as an ordered list of stages.
//! - **Parser engine**: [`TdsContext`] reads tokens from the packet stream,
//!   applies each one to session state, and raises accumulated server
//!   errors and warnings as one [`Error::Server`].
//! - **Rate limiters**: a chain of admission policies wrapping any unit of
//!   work: concurrency bounding and a blocking period after failures.
//!
//! ## Sync and async
//!
//! Every I/O operation is an `async fn` taking `is_async` and a
//! [`CancellationToken`](tokio_util::sync::CancellationToken). With
//! `is_async == false` the transports block and the future completes on its
//! first poll; resolve it with [`block_on_sync`]. Both modes put the same
//! bytes on the wire.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_engine::{ConnectionOptions, RunBehavior, connect};
//! use tokio_util::sync::CancellationToken;
//!
//! let ct = CancellationToken::new();
//! let options = ConnectionOptions::new("tcp:localhost,1433")
//!     .with_sql_auth("sa", "Password123")
//!     .with_trust_server_certificate(true);
//!
//! // Async
//! let mut session = connect(options.clone(), true, &ct).await?;
//!
//! // Sync, on the calling thread
//! let mut session = mssql_engine::block_on_sync(connect(options, false, &ct))?;
//! session.run(RunBehavior::UNTIL_DONE, false, &ct);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod datasource;
pub mod error;
pub mod parser;
pub mod rate_limit;
pub mod sync;

pub use config::{ConnectionOptions, EncryptOption, InfoMessageHandler, IpAddressPreference};
pub use connection::{
    ConnectionHandler, ConnectionHandlerContext, ConnectionPipeline, NegotiatedEncryption,
    ServerInfo, connect,
};
pub use datasource::{DataSource, Protocol};
pub use error::{ConnectAttempt, Error, NegotiationError, Result, ServerErrors, TransportError};
pub use parser::{ErrorWarningsState, ParserState, RunBehavior, SessionInfo, TdsContext};
pub use rate_limit::{
    Admission, BlockingPeriodLimiter, ConcurrencyLimiter, Outcome, PassthroughLimiter,
    RateLimiter, RateLimiterChain,
};
pub use sync::block_on_sync;
