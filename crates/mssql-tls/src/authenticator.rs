//! Client TLS authentication over a dual-mode [`Transport`].
//!
//! The handshake is driven sans-IO: rustls produces and consumes TLS records
//! in memory and the records are moved over the transport with the caller's
//! `is_async` flag, so the same code runs blocking or suspending.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use mssql_codec::{BoxTransport, Transport, cancellable};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_util::sync::CancellationToken;

use crate::config::TlsConfig;
use crate::error::{Result, TlsError};

const TLS_READ_CHUNK: usize = 16 * 1024;

/// Capability to turn a connected transport into a TLS client session.
///
/// Implementations must be replaceable so tests can run the negotiation
/// pipeline without a live server.
#[async_trait]
pub trait TlsAuthenticator: Send + Sync + fmt::Debug {
    /// Run a client handshake over `transport` for `target_host`, advertising
    /// `alpn` (empty for none). Returns the encrypting transport.
    async fn authenticate(
        &self,
        transport: BoxTransport,
        target_host: &str,
        alpn: &[&[u8]],
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<BoxTransport>;
}

/// Accepts any server certificate. Used for `TrustServerCertificate=true`.
#[derive(Debug)]
struct DangerousServerCertVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for DangerousServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// rustls-backed [`TlsAuthenticator`].
pub struct RustlsAuthenticator {
    config: TlsConfig,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl RustlsAuthenticator {
    /// Create an authenticator using the ring crypto provider.
    #[must_use]
    pub fn new(config: TlsConfig) -> Self {
        Self {
            config,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// The TLS configuration in use.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    fn client_config(&self, alpn: &[&[u8]]) -> Result<ClientConfig> {
        let versions = self.config.protocol_versions();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&versions)?;

        let mut client_config = if self.config.trust_server_certificate {
            tracing::warn!(
                "TrustServerCertificate is enabled; server certificate validation is disabled"
            );
            let verifier = DangerousServerCertVerifier {
                schemes: self
                    .provider
                    .signature_verification_algorithms
                    .supported_schemes(),
            };
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        };

        client_config.alpn_protocols = self
            .config
            .alpn_protocols
            .iter()
            .cloned()
            .chain(alpn.iter().map(|p| p.to_vec()))
            .collect();
        Ok(client_config)
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut root_store = RootCertStore::empty();
        if self.config.root_certificates.is_empty() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in &self.config.root_certificates {
                root_store
                    .add(cert.clone())
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }
        Ok(root_store)
    }
}

impl fmt::Debug for RustlsAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsAuthenticator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TlsAuthenticator for RustlsAuthenticator {
    async fn authenticate(
        &self,
        mut transport: BoxTransport,
        target_host: &str,
        alpn: &[&[u8]],
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<BoxTransport> {
        let host = self.config.server_name.as_deref().unwrap_or(target_host);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;

        let client_config = self.client_config(alpn)?;
        let mut conn = ClientConnection::new(Arc::new(client_config), server_name)?;

        tracing::debug!(server_name = %host, alpn = alpn.len(), "performing TLS handshake");
        handshake(&mut conn, &mut transport, is_async, ct).await?;
        tracing::debug!(
            protocol = ?conn.protocol_version(),
            alpn = ?conn.alpn_protocol().map(String::from_utf8_lossy),
            "TLS handshake completed"
        );

        Ok(Box::new(TlsTransport::new(transport, conn)))
    }
}

async fn handshake(
    conn: &mut ClientConnection,
    transport: &mut BoxTransport,
    is_async: bool,
    ct: &CancellationToken,
) -> Result<()> {
    let mut scratch = vec![0u8; TLS_READ_CHUNK];

    while conn.is_handshaking() {
        if conn.wants_write() {
            let out = drain_records(conn)?;
            cancellable(transport.write_all(&out, is_async), is_async, ct).await?;
            cancellable(transport.flush(is_async), is_async, ct).await?;
        } else if conn.wants_read() {
            let n = cancellable(transport.read(&mut scratch, is_async), is_async, ct).await?;
            if n == 0 {
                return Err(TlsError::ConnectionClosed);
            }
            let mut data = &scratch[..n];
            while !data.is_empty() {
                conn.read_tls(&mut data)?;
                conn.process_new_packets()?;
            }
        } else {
            return Err(TlsError::HandshakeFailed("handshake stalled".into()));
        }
    }

    if conn.wants_write() {
        let out = drain_records(conn)?;
        cancellable(transport.write_all(&out, is_async), is_async, ct).await?;
        cancellable(transport.flush(is_async), is_async, ct).await?;
    }
    Ok(())
}

fn drain_records(conn: &mut ClientConnection) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out)?;
    }
    Ok(out)
}

fn feed_records(conn: &mut ClientConnection, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        conn.read_tls(&mut data)?;
        conn.process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    Ok(())
}

/// Transport that encrypts everything written to it.
pub struct TlsTransport {
    inner: BoxTransport,
    conn: ClientConnection,
    scratch: Vec<u8>,
}

impl TlsTransport {
    fn new(inner: BoxTransport, conn: ClientConnection) -> Self {
        Self {
            inner,
            conn,
            scratch: vec![0u8; TLS_READ_CHUNK],
        }
    }

    async fn write_pending(&mut self, is_async: bool) -> io::Result<()> {
        if self.conn.wants_write() {
            let out = drain_records(&mut self.conn)?;
            self.inner.write_all(&out, is_async).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("inner", &self.inner)
            .field("protocol", &self.conn.protocol_version())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn read(&mut self, buf: &mut [u8], is_async: bool) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            self.write_pending(is_async).await?;
            let n = self.inner.read(&mut self.scratch, is_async).await?;
            if n == 0 {
                return Ok(0);
            }
            feed_records(&mut self.conn, &self.scratch[..n])?;
        }
    }

    async fn write_all(&mut self, buf: &[u8], is_async: bool) -> io::Result<()> {
        self.conn.writer().write_all(buf)?;
        self.write_pending(is_async).await
    }

    async fn flush(&mut self, is_async: bool) -> io::Result<()> {
        self.write_pending(is_async).await?;
        self.inner.flush(is_async).await
    }

    fn into_inner(self: Box<Self>) -> Option<BoxTransport> {
        Some(self.inner)
    }
}
