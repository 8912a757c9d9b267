//! Connection configuration.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use mssql_tls::{RustlsAuthenticator, TlsAuthenticator, TlsConfig};
use tds_protocol::packet::MAX_PACKET_SIZE;
use tds_protocol::token::ServerMessage;
use tds_protocol::version::TdsVersion;

use crate::error::{Error, Result};

/// Default packet size requested at login.
pub const DEFAULT_PACKET_SIZE: u32 = 8000;

/// Smallest packet size the server accepts.
pub const MIN_PACKET_SIZE: u32 = 512;

/// How the connection is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptOption {
    /// Encrypt only if the server requires it; the login is always protected.
    Optional,
    /// Encrypt the whole connection after a cleartext pre-login (TDS 7.4).
    #[default]
    Mandatory,
    /// TLS before any TDS traffic (TDS 8.0).
    Strict,
}

impl EncryptOption {
    /// TDS version requested at login.
    #[must_use]
    pub fn tds_version(self) -> TdsVersion {
        match self {
            Self::Strict => TdsVersion::V8_0,
            Self::Optional | Self::Mandatory => TdsVersion::V7_4,
        }
    }
}

/// Order in which resolved addresses are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpAddressPreference {
    /// IPv4 addresses first.
    #[default]
    IPv4First,
    /// IPv6 addresses first.
    IPv6First,
    /// Resolver order.
    UsePlatformDefault,
}

impl IpAddressPreference {
    /// Compare two addresses under this preference.
    ///
    /// Addresses of the same family always compare equal, so a stable sort
    /// keeps resolver order within each family.
    #[must_use]
    pub fn compare(self, a: &IpAddr, b: &IpAddr) -> Ordering {
        let rank = |addr: &IpAddr| match (self, addr) {
            (Self::IPv4First, IpAddr::V4(_)) | (Self::IPv6First, IpAddr::V6(_)) => 0,
            (Self::UsePlatformDefault, _) => 0,
            _ => 1,
        };
        rank(a).cmp(&rank(b))
    }
}

/// Callback receiving informational server messages.
pub type InfoMessageHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Options for one connection attempt.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Data source string, e.g. `tcp:server,1433`.
    pub data_source: String,
    /// Encryption mode.
    pub encrypt: EncryptOption,
    /// Skip server certificate validation.
    pub trust_server_certificate: bool,
    /// Host name expected in the server certificate.
    pub host_name_in_certificate: Option<String>,
    /// Address family preference for TCP.
    pub ip_address_preference: IpAddressPreference,
    /// Time allowed for each TCP connect.
    pub connect_timeout: Duration,
    /// Idle time before the first keep-alive probe.
    pub keep_alive_time: Duration,
    /// Interval between keep-alive probes.
    pub keep_alive_interval: Duration,
    /// Packet size requested at login.
    pub packet_size: u32,
    /// Request multiple active result sets.
    pub mars: bool,
    /// Application name sent at login.
    pub application_name: String,
    /// Client machine name sent at login.
    pub workstation_id: Option<String>,
    /// SQL authentication user.
    pub user: Option<String>,
    /// SQL authentication password.
    pub password: Option<String>,
    /// Initial database.
    pub database: Option<String>,
    /// TLS handshake implementation; defaults to rustls.
    pub tls_authenticator: Option<Arc<dyn TlsAuthenticator>>,
    /// Receives informational messages; without one they are reported as warnings.
    pub info_message_handler: Option<InfoMessageHandler>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            data_source: String::from("localhost"),
            encrypt: EncryptOption::default(),
            trust_server_certificate: false,
            host_name_in_certificate: None,
            ip_address_preference: IpAddressPreference::default(),
            connect_timeout: Duration::from_secs(15),
            keep_alive_time: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(1),
            packet_size: DEFAULT_PACKET_SIZE,
            mars: false,
            application_name: String::from("mssql-engine"),
            workstation_id: None,
            user: None,
            password: None,
            database: None,
            tls_authenticator: None,
            info_message_handler: None,
        }
    }
}

impl ConnectionOptions {
    /// Create options for a data source.
    #[must_use]
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            ..Self::default()
        }
    }

    /// Set the encryption mode.
    #[must_use]
    pub fn with_encrypt(mut self, encrypt: EncryptOption) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Skip server certificate validation.
    #[must_use]
    pub fn with_trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Set the host name expected in the server certificate.
    #[must_use]
    pub fn with_host_name_in_certificate(mut self, host: impl Into<String>) -> Self {
        self.host_name_in_certificate = Some(host.into());
        self
    }

    /// Set the address family preference.
    #[must_use]
    pub fn with_ip_address_preference(mut self, preference: IpAddressPreference) -> Self {
        self.ip_address_preference = preference;
        self
    }

    /// Set the per-address connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set TCP keep-alive time and probe interval.
    #[must_use]
    pub fn with_keep_alive(mut self, time: Duration, interval: Duration) -> Self {
        self.keep_alive_time = time;
        self.keep_alive_interval = interval;
        self
    }

    /// Set the packet size requested at login.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Request multiple active result sets.
    #[must_use]
    pub fn with_mars(mut self, mars: bool) -> Self {
        self.mars = mars;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn with_workstation_id(mut self, id: impl Into<String>) -> Self {
        self.workstation_id = Some(id.into());
        self
    }

    /// Use SQL authentication.
    #[must_use]
    pub fn with_sql_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Inject a TLS handshake implementation.
    #[must_use]
    pub fn with_tls_authenticator(mut self, authenticator: Arc<dyn TlsAuthenticator>) -> Self {
        self.tls_authenticator = Some(authenticator);
        self
    }

    /// Receive informational server messages.
    #[must_use]
    pub fn with_info_message_handler(
        mut self,
        handler: impl Fn(&ServerMessage) + Send + Sync + 'static,
    ) -> Self {
        self.info_message_handler = Some(Arc::new(handler));
        self
    }

    /// TLS configuration derived from these options.
    #[must_use]
    pub fn tls_config(&self) -> TlsConfig {
        let config = TlsConfig::new().trust_server_certificate(self.trust_server_certificate);
        match &self.host_name_in_certificate {
            Some(host) => config.with_server_name(host.clone()),
            None => config,
        }
    }

    /// The injected TLS authenticator, or a rustls one built from these options.
    #[must_use]
    pub fn authenticator(&self) -> Arc<dyn TlsAuthenticator> {
        match &self.tls_authenticator {
            Some(authenticator) => Arc::clone(authenticator),
            None => Arc::new(RustlsAuthenticator::new(self.tls_config())),
        }
    }

    /// Check option values.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE as u32).contains(&self.packet_size) {
            return Err(Error::Config(format!(
                "packet size {} is outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect timeout must be positive".into()));
        }
        if self.user.is_none() {
            return Err(Error::Config("SQL authentication requires a user".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("data_source", &self.data_source)
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("ip_address_preference", &self.ip_address_preference)
            .field("connect_timeout", &self.connect_timeout)
            .field("packet_size", &self.packet_size)
            .field("mars", &self.mars)
            .field("application_name", &self.application_name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}
