//! # mssql-tls
//!
//! TLS negotiation layer for SQL Server connections.
//!
//! Two negotiation variants are supported:
//!
//! ### TDS 7.x
//! ```text
//! TCP Connect → PreLogin (cleartext) → TLS Handshake in PRELOGIN packets → Login7 (encrypted)
//! ```
//!
//! ### TDS 8.0 (strict)
//! ```text
//! TCP Connect → TLS Handshake (ALPN "tds/8.0") → PreLogin (encrypted) → Login7 (encrypted)
//! ```
//!
//! The handshake is performed by a [`TlsAuthenticator`]. [`RustlsAuthenticator`]
//! is the production implementation; tests inject their own. For TDS 7.x the
//! raw transport is first wrapped in [`TlsOverTds`] so handshake records are
//! carried inside PRELOGIN packets.
//!
//! ## Security
//!
//! Server certificates are validated against the Mozilla root store unless
//! custom roots are configured. `TrustServerCertificate` disables validation
//! and logs a warning.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod authenticator;
pub mod config;
pub mod error;
pub mod tls_over_tds;

pub use authenticator::{RustlsAuthenticator, TlsAuthenticator, TlsTransport};
pub use config::{TlsConfig, TlsVersion};
pub use error::{Result, TlsError};
pub use tls_over_tds::{FramingSwitch, TlsOverTds};

/// ALPN protocol identifier for TDS 8.0.
pub const TDS8_ALPN: &[u8] = b"tds/8.0";
