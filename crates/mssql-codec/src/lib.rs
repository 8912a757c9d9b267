//! # mssql-codec
//!
//! Transport abstraction and packet framing for the TDS engine.
//!
//! ## Architecture
//!
//! ```text
//! Transport (TCP / pipe / TLS / memory) → TdsCodec (packet framing) → TdsStream → engine
//! ```
//!
//! Every I/O method takes an `is_async` flag. The same code path runs either
//! with blocking transport calls on the caller's thread or with suspension on
//! the tokio runtime, and both produce identical bytes on the wire.
//!
//! ```rust,ignore
//! use mssql_codec::{MemoryTransport, TdsStream};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut stream = TdsStream::new(Box::new(MemoryTransport::new()));
//! stream.write_message(PacketType::PreLogin, &payload, false, &CancellationToken::new()).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod packet_codec;
pub mod stream;
pub mod transport;

pub use error::CodecError;
pub use packet_codec::{Packet, TdsCodec};
pub use stream::{TdsStream, cancellable};
pub use transport::{BoxTransport, MemoryTransport, Transport};
