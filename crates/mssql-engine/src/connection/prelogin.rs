//! Pre-login and TLS negotiation.
//!
//! TDS 7.4: cleartext PRELOGIN exchange, then (unless no encryption was
//! agreed) a TLS handshake carried in PRELOGIN packets. TDS 8.0: TLS with
//! ALPN `tds/8.0` first, then the PRELOGIN exchange inside TLS with the
//! ENCRYPT option ignored.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use mssql_codec::{BoxTransport, TdsStream};
use mssql_tls::{FramingSwitch, TDS8_ALPN, TlsAuthenticator, TlsOverTds};
use tds_protocol::packet::PacketType;
use tds_protocol::prelogin::{EncryptionLevel, PreLogin};
use tokio_util::sync::CancellationToken;

use super::ConnectionHandler;
use super::context::{ConnectionHandlerContext, NegotiatedEncryption, ServerInfo};
use crate::config::EncryptOption;
use crate::error::{NegotiationError, Result};

/// Negotiation state for one pre-login exchange.
pub struct PreloginHandlerContext {
    /// TLS precedes all TDS traffic.
    pub tls_first: bool,
    /// Encryption level the client asks for.
    pub internal_encryption: EncryptionLevel,
    /// Whether the server offered any encryption.
    pub server_supports_encryption: bool,
    /// Name validated against the server certificate.
    pub target_host: String,
    /// Request MARS.
    pub mars: bool,
    /// Performs TLS handshakes.
    pub authenticator: Arc<dyn TlsAuthenticator>,
}

impl PreloginHandlerContext {
    /// Derive negotiation settings from the connection context.
    pub fn new(ctx: &ConnectionHandlerContext) -> Result<Self> {
        let options = &ctx.options;
        let tls_first = options.encrypt == EncryptOption::Strict;
        let internal_encryption = match options.encrypt {
            EncryptOption::Strict => EncryptionLevel::NotSupported,
            EncryptOption::Mandatory => EncryptionLevel::On,
            EncryptOption::Optional => EncryptionLevel::Off,
        };
        let target_host = match &options.host_name_in_certificate {
            Some(host) => host.clone(),
            None => ctx.data_source()?.server_name.clone(),
        };
        Ok(Self {
            tls_first,
            internal_encryption,
            server_supports_encryption: false,
            target_host,
            mars: options.mars,
            authenticator: options.authenticator(),
        })
    }

    /// The PRELOGIN request.
    #[must_use]
    pub fn request(&self) -> PreLogin {
        PreLogin::new()
            .with_version(client_version(), 0)
            .with_encryption(self.internal_encryption)
            .with_thread_id(std::process::id())
            .with_mars(self.mars)
    }
}

impl fmt::Debug for PreloginHandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloginHandlerContext")
            .field("tls_first", &self.tls_first)
            .field("internal_encryption", &self.internal_encryption)
            .field("server_supports_encryption", &self.server_supports_encryption)
            .field("target_host", &self.target_host)
            .field("mars", &self.mars)
            .finish_non_exhaustive()
    }
}

fn client_version() -> u32 {
    let part = |s: &str| s.parse::<u8>().unwrap_or(0);
    u32::from_be_bytes([
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        0,
        part(env!("CARGO_PKG_VERSION_PATCH")),
    ])
}

/// Combine the client's and server's ENCRYPT options.
///
/// A server without encryption is refused outright, since the login is
/// always protected.
pub fn negotiate_encryption(
    client: EncryptionLevel,
    server: EncryptionLevel,
) -> std::result::Result<NegotiatedEncryption, NegotiationError> {
    if server == EncryptionLevel::NotSupported {
        return Err(NegotiationError::EncryptionNotSupportedByServer);
    }
    match (client, server) {
        (EncryptionLevel::Off, EncryptionLevel::Off) => Ok(NegotiatedEncryption::LoginOnly),
        (EncryptionLevel::NotSupported, EncryptionLevel::Required) => {
            Err(NegotiationError::EncryptionNotSupportedByClient)
        }
        (EncryptionLevel::NotSupported, _) => Ok(NegotiatedEncryption::None),
        _ => Ok(NegotiatedEncryption::Full),
    }
}

struct Negotiated {
    transport: BoxTransport,
    response: PreLogin,
    encryption: NegotiatedEncryption,
    framing_switch: Option<FramingSwitch>,
}

/// Runs the pre-login exchange and TLS negotiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreloginHandler;

impl PreloginHandler {
    async fn exchange(
        stream: &mut TdsStream,
        request: &PreLogin,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<PreLogin> {
        stream
            .write_message(PacketType::PreLogin, &request.encode(), is_async, ct)
            .await?;
        let payload = stream.read_message(is_async, ct).await?;
        let response = PreLogin::decode(payload)?;
        if response.instance_mismatch {
            return Err(NegotiationError::InstanceMismatch.into());
        }
        Ok(response)
    }

    async fn tls_first(
        pctx: &mut PreloginHandlerContext,
        raw: BoxTransport,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Negotiated> {
        tracing::debug!(host = %pctx.target_host, "TLS handshake before pre-login");
        let tls = pctx
            .authenticator
            .authenticate(raw, &pctx.target_host, &[TDS8_ALPN], is_async, ct)
            .await?;

        let mut stream = TdsStream::new(tls);
        let response = Self::exchange(&mut stream, &pctx.request(), is_async, ct).await?;
        pctx.server_supports_encryption = true;
        Ok(Negotiated {
            transport: stream.into_transport(),
            response,
            encryption: NegotiatedEncryption::Strict,
            framing_switch: None,
        })
    }

    async fn tls_after_prelogin(
        pctx: &mut PreloginHandlerContext,
        raw: BoxTransport,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Negotiated> {
        let mut stream = TdsStream::new(raw);
        let response = Self::exchange(&mut stream, &pctx.request(), is_async, ct).await?;
        pctx.server_supports_encryption = response.encryption != EncryptionLevel::NotSupported;

        let encryption = negotiate_encryption(pctx.internal_encryption, response.encryption)?;
        tracing::debug!(
            client = ?pctx.internal_encryption,
            server = ?response.encryption,
            negotiated = ?encryption,
            "pre-login encryption negotiated"
        );

        let raw = stream.into_transport();
        if !encryption.uses_tls() {
            return Ok(Negotiated {
                transport: raw,
                response,
                encryption,
                framing_switch: None,
            });
        }

        let (wrapper, switch) = TlsOverTds::new(raw);
        let tls = pctx
            .authenticator
            .authenticate(Box::new(wrapper), &pctx.target_host, &[], is_async, ct)
            .await?;
        switch.disable();
        Ok(Negotiated {
            transport: tls,
            response,
            encryption,
            framing_switch: Some(switch),
        })
    }
}

#[async_trait]
impl ConnectionHandler for PreloginHandler {
    async fn handle(
        &self,
        ctx: &mut ConnectionHandlerContext,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        let mut pctx = PreloginHandlerContext::new(ctx)?;
        let raw = ctx.take_transport()?;

        let negotiated = if pctx.tls_first {
            Self::tls_first(&mut pctx, raw, is_async, ct).await?
        } else {
            Self::tls_after_prelogin(&mut pctx, raw, is_async, ct).await?
        };

        let server_name = ctx.data_source()?.server_name.clone();
        let info = ServerInfo::from_prelogin(server_name, &negotiated.response);
        tracing::debug!(
            server_version = %info.product_version(),
            mars = info.mars,
            fed_auth_required = info.fed_auth_required,
            "pre-login completed"
        );
        ctx.server_info = Some(info);
        ctx.encryption = Some(negotiated.encryption);
        ctx.framing_switch = negotiated.framing_switch;
        ctx.transport = Some(negotiated.transport);
        Ok(())
    }
}
