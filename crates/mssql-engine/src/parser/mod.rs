//! The TDS parser engine.
//!
//! A [`TdsContext`] owns the packet stream of one session. [`TdsContext::run`]
//! drives the loop
//!
//! ```text
//! read token (TokenReader) → process token (processor) → repeat while the response has data
//! ```
//!
//! Decoding and processing never suspend; only packet reads do. Server
//! errors and warnings are collected in an [`ErrorWarningsState`] and raised
//! together when the unit of work ends.

pub mod context;
pub mod errors;
pub mod processor;
pub mod reader;
pub mod run;

pub use context::{
    InfoListener, ParserState, Routing, RunBehavior, SessionInfo, StatementResult, TdsContext,
};
pub use errors::ErrorWarningsState;
pub use reader::TokenReader;
pub use run::TIMEOUT_ERROR_NUMBER;
