//! Named pipe transport handler.
//!
//! On Windows the pipe `\\host\pipe\<name>` is opened directly. Elsewhere
//! named pipes are mapped to Unix domain sockets under a socket directory:
//! `sql\query` becomes `<dir>/sql/query`. Only local pipes can be mapped.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use mssql_codec::BoxTransport;
use tokio_util::sync::CancellationToken;

use super::TransportHandler;
use crate::config::ConnectionOptions;
use crate::datasource::{DEFAULT_PIPE_NAME, DataSource, Protocol};
use crate::error::{Error, Result, TransportError};

/// Opens named pipe connections.
#[derive(Clone)]
pub struct NamedPipeHandler {
    socket_dir: PathBuf,
}

impl Default for NamedPipeHandler {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
        }
    }
}

impl fmt::Debug for NamedPipeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedPipeHandler")
            .field("socket_dir", &self.socket_dir)
            .finish()
    }
}

impl NamedPipeHandler {
    /// Map pipes to sockets under `dir` on platforms without named pipes.
    #[must_use]
    pub fn with_socket_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: dir.into(),
        }
    }

    /// Full Windows pipe path.
    #[must_use]
    pub fn pipe_path(host: &str, pipe_name: &str) -> String {
        format!(r"\\{host}\pipe\{pipe_name}")
    }

    /// Socket path a local pipe maps to.
    #[must_use]
    pub fn socket_path(&self, pipe_name: &str) -> PathBuf {
        pipe_name
            .split('\\')
            .filter(|segment| !segment.is_empty())
            .fold(self.socket_dir.clone(), |path, segment| path.join(segment))
    }

    /// Open `pipe_name` on `host`.
    pub async fn open_pipe(
        &self,
        host: &str,
        pipe_name: &str,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<BoxTransport> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tracing::info!(host = %host, pipe = %pipe_name, "connecting to SQL Server over named pipe");
        self.open_platform(host, pipe_name, is_async, ct).await
    }

    #[cfg(unix)]
    async fn open_platform(
        &self,
        host: &str,
        pipe_name: &str,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<BoxTransport> {
        use super::socket::SocketTransport;

        if !matches!(host, "." | "localhost" | "(local)") {
            return Err(Error::Config(format!(
                "remote named pipe '{}' is only reachable on Windows",
                Self::pipe_path(host, pipe_name)
            )));
        }
        let path = self.socket_path(pipe_name);
        tracing::debug!(path = %path.display(), "mapping named pipe to a Unix socket");

        if is_async {
            let stream = tokio::select! {
                biased;
                () = ct.cancelled() => return Err(Error::Cancelled),
                result = tokio::net::UnixStream::connect(&path) => result.map_err(TransportError::Socket)?,
            };
            Ok(Box::new(SocketTransport::<std::os::unix::net::UnixStream>::nonblocking(stream)))
        } else {
            let stream =
                std::os::unix::net::UnixStream::connect(&path).map_err(TransportError::Socket)?;
            Ok(Box::new(SocketTransport::blocking(stream)))
        }
    }

    #[cfg(windows)]
    async fn open_platform(
        &self,
        host: &str,
        pipe_name: &str,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<BoxTransport> {
        let path = Self::pipe_path(host, pipe_name);
        if is_async {
            let client = tokio::select! {
                biased;
                () = ct.cancelled() => return Err(Error::Cancelled),
                result = async {
                    tokio::net::windows::named_pipe::ClientOptions::new().open(&path)
                } => result.map_err(TransportError::Socket)?,
            };
            Ok(Box::new(windows::PipeTransport::Async(client)))
        } else {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(TransportError::Socket)?;
            Ok(Box::new(windows::PipeTransport::Blocking(file)))
        }
    }
}

#[async_trait]
impl TransportHandler for NamedPipeHandler {
    async fn open(
        &self,
        data_source: &DataSource,
        _options: &ConnectionOptions,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Option<BoxTransport>> {
        if data_source.resolved_protocol != Protocol::NamedPipe {
            return Ok(None);
        }
        let host = data_source
            .pipe_host
            .as_deref()
            .unwrap_or(&data_source.server_name);
        let pipe_name = data_source.pipe_name.as_deref().unwrap_or(DEFAULT_PIPE_NAME);
        self.open_pipe(host, pipe_name, is_async, ct).await.map(Some)
    }
}

#[cfg(windows)]
mod windows {
    use std::fs::File;
    use std::io::{self, Read, Write};

    use async_trait::async_trait;
    use mssql_codec::Transport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::windows::named_pipe::NamedPipeClient;

    /// A pipe opened in one mode is only driven in that mode.
    #[derive(Debug)]
    pub(super) enum PipeTransport {
        Blocking(File),
        Async(NamedPipeClient),
    }

    fn mode_mismatch() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "named pipe used in a different mode than opened")
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn read(&mut self, buf: &mut [u8], is_async: bool) -> io::Result<usize> {
            match (self, is_async) {
                (Self::Blocking(file), false) => file.read(buf),
                (Self::Async(client), true) => client.read(buf).await,
                _ => Err(mode_mismatch()),
            }
        }

        async fn write_all(&mut self, buf: &[u8], is_async: bool) -> io::Result<()> {
            match (self, is_async) {
                (Self::Blocking(file), false) => file.write_all(buf),
                (Self::Async(client), true) => client.write_all(buf).await,
                _ => Err(mode_mismatch()),
            }
        }

        async fn flush(&mut self, is_async: bool) -> io::Result<()> {
            match (self, is_async) {
                (Self::Blocking(file), false) => file.flush(),
                (Self::Async(client), true) => client.flush().await,
                _ => Err(mode_mismatch()),
            }
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sync::block_on_sync;
    use mssql_codec::Transport;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;

    fn unique_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let name = format!("mssql-engine-{tag}-{}-{nanos}", std::process::id());
        let dir = std::env::temp_dir().join(name);
        std::fs::create_dir_all(dir.join("sql")).unwrap();
        dir
    }

    #[test]
    fn test_socket_path_mapping() {
        let handler = NamedPipeHandler::with_socket_dir("/run/mssql");
        assert_eq!(
            handler.socket_path(r"MSSQL$inst\sql\query"),
            PathBuf::from("/run/mssql/MSSQL$inst/sql/query")
        );
        assert_eq!(
            NamedPipeHandler::pipe_path("host", DEFAULT_PIPE_NAME),
            r"\\host\pipe\sql\query"
        );
    }

    #[test]
    fn test_sync_open_local_pipe() {
        let dir = unique_dir("np");
        let handler = NamedPipeHandler::with_socket_dir(&dir);
        let listener = UnixListener::bind(handler.socket_path(DEFAULT_PIPE_NAME)).unwrap();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            peer.read_exact(&mut buf).unwrap();
            peer.write_all(&buf).unwrap();
        });

        let ds = DataSource::parse(r"np:\\.\pipe\sql\query").unwrap();
        let options = ConnectionOptions::new(r"np:\\.\pipe\sql\query");
        let ct = CancellationToken::new();
        let mut transport = block_on_sync(handler.open(&ds, &options, false, &ct))
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 3];
        let n = block_on_sync(async {
            transport.write_all(b"abc", false).await.unwrap();
            Ok(transport.read(&mut buf, false).await.unwrap())
        })
        .unwrap();
        assert!(n > 0);
        assert_eq!(&buf[..n], &b"abc"[..n]);
        server.join().unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_remote_pipe_rejected_off_windows() {
        let handler = NamedPipeHandler::default();
        let ds = DataSource::parse(r"\\remote\pipe\sql\query").unwrap();
        let options = ConnectionOptions::new(r"\\remote\pipe\sql\query");
        let err = handler
            .open(&ds, &options, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_other_protocols_delegate() {
        let handler = NamedPipeHandler::default();
        let ds = DataSource::parse("server").unwrap();
        let options = ConnectionOptions::new("server");
        let opened = handler
            .open(&ds, &options, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(opened.is_none());
    }
}
