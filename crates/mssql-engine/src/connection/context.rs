//! State threaded through the connection pipeline.

use std::fmt;

use mssql_codec::BoxTransport;
use mssql_tls::FramingSwitch;
use tds_protocol::prelogin::PreLogin;

use crate::config::ConnectionOptions;
use crate::datasource::DataSource;
use crate::error::Error;
use crate::parser::TdsContext;

/// Encryption in effect after pre-login negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedEncryption {
    /// No TLS at all.
    None,
    /// TLS protects the login only; the rest of the session is cleartext.
    LoginOnly,
    /// TLS for the whole session.
    Full,
    /// TLS before any TDS traffic (TDS 8.0).
    Strict,
}

impl NegotiatedEncryption {
    /// Whether a TLS handshake is needed.
    #[must_use]
    pub fn uses_tls(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// What the server reported during pre-login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Host name the transport connected to.
    pub resolved_server_name: String,
    /// Product version from the pre-login response.
    pub version: u32,
    /// Product sub-build.
    pub sub_build: u16,
    /// Server accepted MARS.
    pub mars: bool,
    /// Server requires federated authentication.
    pub fed_auth_required: bool,
}

impl ServerInfo {
    pub(crate) fn from_prelogin(resolved_server_name: String, response: &PreLogin) -> Self {
        Self {
            resolved_server_name,
            version: response.version,
            sub_build: response.sub_build,
            mars: response.mars,
            fed_auth_required: response.fed_auth_required,
        }
    }

    /// Server product version as `major.minor.build`.
    #[must_use]
    pub fn product_version(&self) -> String {
        let [major, minor, hi, lo] = self.version.to_be_bytes();
        format!("{major}.{minor}.{}", u16::from_be_bytes([hi, lo]))
    }
}

/// Mutable state for one connection attempt.
///
/// Stages fill the fields in order. A stage that fails stores its error in
/// [`ConnectionHandlerContext::error`] and the pipeline stops there.
pub struct ConnectionHandlerContext {
    /// Options for this attempt.
    pub options: ConnectionOptions,
    /// Parsed data source.
    pub data_source: Option<DataSource>,
    /// The open transport; TLS-wrapped once negotiation has run.
    pub transport: Option<BoxTransport>,
    /// Turns TLS-over-TDS framing off after a TDS 7.x handshake.
    pub framing_switch: Option<FramingSwitch>,
    /// Encryption agreed during pre-login.
    pub encryption: Option<NegotiatedEncryption>,
    /// Server details from pre-login.
    pub server_info: Option<ServerInfo>,
    /// The logged-in session.
    pub session: Option<TdsContext>,
    /// Error captured by the failing stage.
    pub error: Option<Error>,
}

impl ConnectionHandlerContext {
    /// A fresh context for `options`.
    #[must_use]
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            data_source: None,
            transport: None,
            framing_switch: None,
            encryption: None,
            server_info: None,
            session: None,
            error: None,
        }
    }

    /// Whether a stage has failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// The data source, or an error if the parsing stage has not run.
    pub fn data_source(&self) -> crate::error::Result<&DataSource> {
        self.data_source
            .as_ref()
            .ok_or_else(|| Error::Config("data source has not been resolved".into()))
    }

    /// Take the transport, or fail if no stage has opened one.
    pub fn take_transport(&mut self) -> crate::error::Result<BoxTransport> {
        self.transport
            .take()
            .ok_or_else(|| Error::Config("no transport has been opened".into()))
    }
}

impl fmt::Debug for ConnectionHandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandlerContext")
            .field("options", &self.options)
            .field("data_source", &self.data_source)
            .field("has_transport", &self.transport.is_some())
            .field("encryption", &self.encryption)
            .field("server_info", &self.server_info)
            .field("has_session", &self.session.is_some())
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_product_version() {
        let response = PreLogin::new().with_version(0x1000_07D0, 0);
        let info = ServerInfo::from_prelogin("localhost".into(), &response);
        assert_eq!(info.product_version(), "16.0.2000");
    }

    #[test]
    fn test_missing_transport_is_an_error() {
        let mut ctx = ConnectionHandlerContext::new(ConnectionOptions::new("server"));
        assert!(ctx.take_transport().is_err());
        assert!(ctx.data_source().is_err());
        assert!(!ctx.has_error());
    }
}
