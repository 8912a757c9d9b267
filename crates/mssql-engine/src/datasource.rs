//! Data source parsing.
//!
//! A data source names the endpoint to connect to:
//!
//! ```text
//! [protocol:]server[\instance][,port]
//! np:\\host\pipe\<pipe path>
//! ```
//!
//! Protocol prefixes are `tcp:`, `np:`, `lpc:` (shared memory) and `admin:`
//! (dedicated admin connection). Parsing is case-insensitive and always
//! resolves exactly one concrete protocol.

use crate::error::{Error, Result};

/// Default SQL Server TCP port.
pub const DEFAULT_PORT: u16 = 1433;

/// Dedicated admin connection TCP port.
pub const ADMIN_PORT: u16 = 1434;

/// Default named pipe path, relative to `\\host\pipe\`.
pub const DEFAULT_PIPE_NAME: &str = r"sql\query";

const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_INSTANCE_NAME: &str = "mssqlserver";
const INSTANCE_PIPE_PREFIX: &str = "MSSQL$";
const PIPE_INSTANCE_HEADER: &str = "mssql$";
const PIPE_TOKEN: &str = "pipe";

/// Transport protocol named by a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP/IP.
    Tcp,
    /// Named pipes.
    NamedPipe,
    /// Shared memory (local only).
    SharedMemory,
    /// Dedicated admin connection over TCP.
    Admin,
    /// No protocol prefix was given.
    None,
}

/// A parsed data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    /// Protocol as written by the user.
    pub protocol: Protocol,
    /// The concrete protocol to connect with.
    pub resolved_protocol: Protocol,
    /// Server host name.
    pub server_name: String,
    /// Explicit TCP port.
    pub port: Option<u16>,
    /// Named instance.
    pub instance_name: Option<String>,
    /// Host of a named pipe path.
    pub pipe_host: Option<String>,
    /// Pipe path below `\\host\pipe\`.
    pub pipe_name: Option<String>,
    /// The port must be discovered through SQL Server Resolution Protocol.
    pub requires_ssrp: bool,
}

impl DataSource {
    /// Parse a data source string.
    pub fn parse(input: &str) -> Result<Self> {
        let working = input.trim().to_lowercase();
        let protocol = parse_protocol(&working);
        let rest = match (working.find(':'), protocol) {
            (Some(colon), p) if p != Protocol::None => working[colon + 1..].trim().to_string(),
            _ => working.clone(),
        };

        if rest.contains('/') {
            return Err(invalid(input, "pipe paths only allow backslashes"));
        }

        let mut source = Self {
            protocol,
            resolved_protocol: protocol,
            server_name: String::new(),
            port: None,
            instance_name: None,
            pipe_host: None,
            pipe_name: None,
            requires_ssrp: false,
        };

        if rest.starts_with(r"\\") || protocol == Protocol::NamedPipe {
            source.infer_named_pipe(input, &rest)?;
        } else {
            source.infer_connection_details(input, &rest)?;
        }

        source.resolved_protocol = match source.protocol {
            Protocol::None | Protocol::Admin => Protocol::Tcp,
            other => other,
        };
        Ok(source)
    }

    /// TCP port to connect to.
    ///
    /// Named instances without a port would need SSRP; the default port is
    /// used for them instead.
    #[must_use]
    pub fn tcp_port(&self) -> u16 {
        match (self.port, self.protocol) {
            (Some(port), _) => port,
            (None, Protocol::Admin) => ADMIN_PORT,
            (None, _) => DEFAULT_PORT,
        }
    }

    fn infer_named_pipe(&mut self, input: &str, rest: &str) -> Result<()> {
        if !rest.contains(r"\\") {
            // np:server or np:server\instance
            if rest.contains('\\') {
                let tokens: Vec<&str> = rest.split('\\').collect();
                if tokens.len() != 2 {
                    return Err(invalid(input, "malformed named pipe instance"));
                }
                self.server_name = tokens[0].to_string();
                self.pipe_name = Some(format!(
                    "{INSTANCE_PIPE_PREFIX}{}\\{DEFAULT_PIPE_NAME}",
                    tokens[1]
                ));
                self.instance_name = Some(tokens[1].to_string());
            } else {
                self.server_name = rest.to_string();
                self.pipe_name = Some(DEFAULT_PIPE_NAME.to_string());
            }
            self.infer_local_server_name();
            self.pipe_host = Some(self.server_name.clone());
            return Ok(());
        }

        // \\host\pipe\path...: at least six segments counting the two empty
        // ones before the host.
        let tokens: Vec<&str> = rest.split('\\').collect();
        if tokens.len() < 6 {
            return Err(invalid(input, "named pipe path is too short"));
        }
        let host = tokens[2];
        if host.is_empty() {
            return Err(invalid(input, "named pipe path has no host"));
        }
        if tokens[3] != PIPE_TOKEN {
            return Err(invalid(input, r"named pipe path must start with \\host\pipe"));
        }

        if let Some(instance) = tokens[4].strip_prefix(PIPE_INSTANCE_HEADER) {
            self.instance_name = Some(instance.to_string());
        }
        let pipe_name = tokens[4..].join("\\");
        if self.instance_name.as_deref().is_none_or(str::is_empty) && pipe_name != DEFAULT_PIPE_NAME {
            self.instance_name = Some(format!("{PIPE_TOKEN}{pipe_name}"));
        }

        self.server_name = if is_local_host(host) {
            DEFAULT_HOSTNAME.to_string()
        } else {
            host.to_string()
        };
        self.pipe_host = Some(host.to_string());
        self.pipe_name = Some(pipe_name);

        match self.protocol {
            Protocol::None => self.protocol = Protocol::NamedPipe,
            Protocol::NamedPipe => {}
            _ => return Err(invalid(input, "pipe path given for a non-pipe protocol")),
        }
        Ok(())
    }

    fn infer_connection_details(&mut self, input: &str, rest: &str) -> Result<()> {
        let tokens: Vec<&str> = rest.split(['\\', ',']).collect();
        self.server_name = tokens[0].trim().to_string();

        let comma = rest.find(',');
        let backslash = rest.find('\\');

        if let Some(comma) = comma {
            let parameter = match backslash {
                Some(backslash) if comma > backslash => tokens.get(2),
                _ => tokens.get(1),
            }
            .map_or("", |t| t.trim());
            if parameter.is_empty() {
                return Err(invalid(input, "empty port"));
            }

            match self.protocol {
                Protocol::None => self.protocol = Protocol::Tcp,
                Protocol::Tcp => {}
                _ => return Err(invalid(input, "a port is only allowed for TCP")),
            }

            let port: i64 = parameter
                .parse()
                .map_err(|_| invalid(input, "port is not a number"))?;
            let port = u16::try_from(port)
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| invalid(input, "port out of range"))?;
            self.port = Some(port);
        } else if backslash.is_some() {
            let instance = tokens.get(1).map_or("", |t| t.trim());
            if instance.is_empty() {
                return Err(invalid(input, "empty instance name"));
            }
            if instance == DEFAULT_INSTANCE_NAME {
                return Err(invalid(input, "the default instance cannot be named"));
            }
            self.instance_name = Some(instance.to_string());
            self.requires_ssrp = true;
        }

        self.infer_local_server_name();
        Ok(())
    }

    fn infer_local_server_name(&mut self) {
        if self.server_name.is_empty() || is_local_host(&self.server_name) {
            self.server_name = DEFAULT_HOSTNAME.to_string();
        }
    }
}

fn parse_protocol(working: &str) -> Protocol {
    let mut parts = working.split(':');
    let first = parts.next().unwrap_or_default();
    if parts.next().is_none() {
        return Protocol::None;
    }
    match first.trim() {
        "tcp" => Protocol::Tcp,
        "np" => Protocol::NamedPipe,
        "lpc" => Protocol::SharedMemory,
        "admin" => Protocol::Admin,
        // Possibly an IPv6 address.
        _ => Protocol::None,
    }
}

fn is_local_host(name: &str) -> bool {
    matches!(name, "." | "(local)" | "localhost")
}

fn invalid(input: &str, reason: &str) -> Error {
    Error::Config(format!("invalid data source '{input}': {reason}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_host_defaults_to_tcp() {
        let ds = DataSource::parse("  DBHost ").unwrap();
        assert_eq!(ds.protocol, Protocol::None);
        assert_eq!(ds.resolved_protocol, Protocol::Tcp);
        assert_eq!(ds.server_name, "dbhost");
        assert_eq!(ds.tcp_port(), DEFAULT_PORT);
    }

    #[test]
    fn test_tcp_with_port() {
        let ds = DataSource::parse(" tcp : server , 1500 ").unwrap();
        assert_eq!(ds.protocol, Protocol::Tcp);
        assert_eq!(ds.server_name, "server");
        assert_eq!(ds.port, Some(1500));

        let ds = DataSource::parse("server,1500").unwrap();
        assert_eq!(ds.protocol, Protocol::Tcp);
        assert_eq!(ds.tcp_port(), 1500);
    }

    #[test]
    fn test_instance_with_port_skips_ssrp() {
        let ds = DataSource::parse(r"server\inst,1600").unwrap();
        assert_eq!(ds.port, Some(1600));
        assert!(!ds.requires_ssrp);
        assert_eq!(ds.instance_name, None);
    }

    #[test]
    fn test_named_instance_requires_ssrp() {
        let ds = DataSource::parse(r"Server\SQLEXPRESS").unwrap();
        assert_eq!(ds.instance_name.as_deref(), Some("sqlexpress"));
        assert!(ds.requires_ssrp);
    }

    #[test]
    fn test_rejects_bad_sources() {
        for bad in [
            "server,",
            "server,0",
            "server,abc",
            "server,70000",
            r"server\",
            r"server\mssqlserver",
            "server/inst",
            "admin:server,1433",
            r"\\host\pipe",
            r"\\\pipe\sql\query",
            r"\\host\notpipe\sql\query",
            r"tcp:\\host\pipe\sql\query",
        ] {
            assert!(DataSource::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_local_aliases() {
        for local in [".", "(local)", "localhost", "tcp:."] {
            assert_eq!(DataSource::parse(local).unwrap().server_name, "localhost");
        }
    }

    #[test]
    fn test_admin_uses_dac_port() {
        let ds = DataSource::parse("admin:server").unwrap();
        assert_eq!(ds.protocol, Protocol::Admin);
        assert_eq!(ds.resolved_protocol, Protocol::Tcp);
        assert_eq!(ds.tcp_port(), ADMIN_PORT);
    }

    #[test]
    fn test_named_pipe_path() {
        let ds = DataSource::parse(r"\\Host\pipe\MSSQL$Inst\sql\query").unwrap();
        assert_eq!(ds.protocol, Protocol::NamedPipe);
        assert_eq!(ds.pipe_host.as_deref(), Some("host"));
        assert_eq!(ds.pipe_name.as_deref(), Some(r"mssql$inst\sql\query"));
        assert_eq!(ds.instance_name.as_deref(), Some("inst"));

        let ds = DataSource::parse(r"np:\\.\pipe\sql\query").unwrap();
        assert_eq!(ds.server_name, "localhost");
        assert_eq!(ds.pipe_host.as_deref(), Some("."));
        assert_eq!(ds.instance_name, None);

        let ds = DataSource::parse(r"\\host\pipe\custom\path").unwrap();
        assert_eq!(ds.instance_name.as_deref(), Some(r"pipecustom\path"));
    }

    #[test]
    fn test_named_pipe_shorthand() {
        let ds = DataSource::parse("np:server").unwrap();
        assert_eq!(ds.pipe_name.as_deref(), Some(DEFAULT_PIPE_NAME));

        let ds = DataSource::parse(r"np:server\inst").unwrap();
        assert_eq!(ds.pipe_host.as_deref(), Some("server"));
        assert_eq!(ds.pipe_name.as_deref(), Some(r"MSSQL$inst\sql\query"));
    }

    #[test]
    fn test_shared_memory_prefix() {
        let ds = DataSource::parse("lpc:.").unwrap();
        assert_eq!(ds.resolved_protocol, Protocol::SharedMemory);
        assert_eq!(ds.server_name, "localhost");
    }

    #[test]
    fn test_ipv6_literal_is_not_a_protocol() {
        let ds = DataSource::parse("::1").unwrap();
        assert_eq!(ds.protocol, Protocol::None);
        assert_eq!(ds.server_name, "::1");
    }
}
