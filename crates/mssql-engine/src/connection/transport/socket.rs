//! Dual-mode socket transport.
//!
//! A socket opened in one mode can be driven in the other: the first call
//! with a different `is_async` converts the socket between its blocking std
//! form and its tokio form. Converting to the tokio form needs a runtime.

use std::fmt::Debug;
use std::io::{self, Read, Write};

use async_trait::async_trait;
use mssql_codec::Transport;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A blocking socket with a tokio counterpart.
pub trait DualModeSocket: Read + Write + Send + Debug + Sized + 'static {
    /// The tokio form.
    type Async: AsyncRead + AsyncWrite + Unpin + Send + Debug;

    /// Register with the runtime.
    fn into_async(self) -> io::Result<Self::Async>;

    /// Deregister and switch back to blocking I/O.
    fn into_blocking(socket: Self::Async) -> io::Result<Self>;
}

impl DualModeSocket for std::net::TcpStream {
    type Async = tokio::net::TcpStream;

    fn into_async(self) -> io::Result<Self::Async> {
        self.set_nonblocking(true)?;
        tokio::net::TcpStream::from_std(self)
    }

    fn into_blocking(socket: Self::Async) -> io::Result<Self> {
        let socket = socket.into_std()?;
        socket.set_nonblocking(false)?;
        Ok(socket)
    }
}

#[cfg(unix)]
impl DualModeSocket for std::os::unix::net::UnixStream {
    type Async = tokio::net::UnixStream;

    fn into_async(self) -> io::Result<Self::Async> {
        self.set_nonblocking(true)?;
        tokio::net::UnixStream::from_std(self)
    }

    fn into_blocking(socket: Self::Async) -> io::Result<Self> {
        let socket = socket.into_std()?;
        socket.set_nonblocking(false)?;
        Ok(socket)
    }
}

#[derive(Debug)]
enum Mode<S: DualModeSocket> {
    Blocking(S),
    Async(S::Async),
}

/// [`Transport`] over a connected socket.
#[derive(Debug)]
pub struct SocketTransport<S: DualModeSocket> {
    mode: Option<Mode<S>>,
}

impl<S: DualModeSocket> SocketTransport<S> {
    /// Wrap a blocking socket.
    #[must_use]
    pub fn blocking(socket: S) -> Self {
        Self {
            mode: Some(Mode::Blocking(socket)),
        }
    }

    /// Wrap a tokio socket.
    #[must_use]
    pub fn nonblocking(socket: S::Async) -> Self {
        Self {
            mode: Some(Mode::Async(socket)),
        }
    }

    /// Whether the socket is currently in its tokio form.
    #[must_use]
    pub fn is_nonblocking(&self) -> bool {
        matches!(self.mode, Some(Mode::Async(_)))
    }

    fn take(&mut self) -> io::Result<Mode<S>> {
        self.mode
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket lost in mode switch"))
    }

    fn as_blocking(&mut self) -> io::Result<&mut S> {
        if let Some(Mode::Async(_)) = self.mode {
            if let Mode::Async(socket) = self.take()? {
                self.mode = Some(Mode::Blocking(S::into_blocking(socket)?));
            }
        }
        match self.mode.as_mut() {
            Some(Mode::Blocking(socket)) => Ok(socket),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "socket lost in mode switch")),
        }
    }

    fn as_async(&mut self) -> io::Result<&mut S::Async> {
        if let Some(Mode::Blocking(_)) = self.mode {
            if let Mode::Blocking(socket) = self.take()? {
                self.mode = Some(Mode::Async(socket.into_async()?));
            }
        }
        match self.mode.as_mut() {
            Some(Mode::Async(socket)) => Ok(socket),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "socket lost in mode switch")),
        }
    }
}

#[async_trait]
impl<S: DualModeSocket> Transport for SocketTransport<S> {
    async fn read(&mut self, buf: &mut [u8], is_async: bool) -> io::Result<usize> {
        if is_async {
            self.as_async()?.read(buf).await
        } else {
            self.as_blocking()?.read(buf)
        }
    }

    async fn write_all(&mut self, buf: &[u8], is_async: bool) -> io::Result<()> {
        if is_async {
            self.as_async()?.write_all(buf).await
        } else {
            self.as_blocking()?.write_all(buf)
        }
    }

    async fn flush(&mut self, is_async: bool) -> io::Result<()> {
        if is_async {
            self.as_async()?.flush().await
        } else {
            self.as_blocking()?.flush()
        }
    }
}
