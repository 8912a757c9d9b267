//! # tds-protocol
//!
//! IO-agnostic implementation of the MS-TDS (Tabular Data Stream) wire
//! format used by Microsoft SQL Server.
//!
//! This crate holds packet headers, the pre-login and LOGIN7 messages, and
//! the response token model. It performs no I/O: decoders work over any
//! [`bytes::Buf`] and tell "need more bytes" apart from "malformed" through
//! [`ProtocolError::is_incomplete`], so the engine above can feed them from
//! a partially buffered network stream.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_protocol::{DecodeContext, Token};
//!
//! let mut buf = &payload[..];
//! let token = Token::decode(&mut buf, &DecodeContext::default())?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod feature;
pub mod login7;
pub mod packet;
pub mod prelogin;
pub mod token;
pub mod version;

pub use error::ProtocolError;
pub use feature::{FeatureId, FeatureRequest, DATA_CLASSIFICATION_VERSION_MAX};
pub use login7::{Login7, OptionFlags1, OptionFlags2, OptionFlags3};
pub use packet::{
    frame_single, PacketHeader, PacketStatus, PacketType, DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE,
    PACKET_HEADER_SIZE,
};
pub use prelogin::{EncryptionLevel, PreLogin, PreLoginOption};
pub use token::{
    ClassificationName, ColumnSensitivity, DataClassification, DecodeContext, Done, DoneStatus,
    EnvChange, EnvChangeType, EnvChangeValue, FeatureAck, FeatureExtAck, FedAuthInfo, LoginAck,
    Order, SensitivityProperty, ServerMessage, Token, TokenType, FATAL_ERROR_CLASS,
    MIN_ERROR_CLASS,
};
pub use version::TdsVersion;
