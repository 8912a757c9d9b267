//! TCP transport handler.
//!
//! Resolves the host, orders the addresses by the configured family
//! preference, and tries them one at a time. In sync mode the connect runs
//! on a non-blocking socket polled until it completes, the connect timeout
//! passes, or the cancellation token fires.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mssql_codec::BoxTransport;
use socket2::{Domain, SockRef, Socket, TcpKeepalive, Type};
use tokio_util::sync::CancellationToken;

use super::TransportHandler;
use super::socket::SocketTransport;
use crate::config::{ConnectionOptions, IpAddressPreference};
use crate::datasource::{DataSource, Protocol};
use crate::error::{ConnectAttempt, Error, Result, TransportError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Opens TCP connections (including the admin connection).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpHandler;

#[async_trait]
impl TransportHandler for TcpHandler {
    async fn open(
        &self,
        data_source: &DataSource,
        options: &ConnectionOptions,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Option<BoxTransport>> {
        if data_source.resolved_protocol != Protocol::Tcp {
            return Ok(None);
        }

        let host = data_source.server_name.as_str();
        let port = data_source.tcp_port();
        if data_source.requires_ssrp && data_source.port.is_none() {
            tracing::warn!(
                instance = ?data_source.instance_name,
                port,
                "instance port discovery is not supported, using the default port"
            );
        }
        tracing::info!(host = %host, port, "connecting to SQL Server over TCP");

        let mut addrs = resolve(host, port, is_async, ct).await?;
        sort_addresses(&mut addrs, options.ip_address_preference);
        tracing::debug!(candidates = addrs.len(), "resolved server addresses");

        let timeout = options.connect_timeout;
        let transport: BoxTransport = if is_async {
            let stream =
                connect_sequential(&addrs, ct, |addr| connect_async(addr, timeout, ct)).await?;
            configure(&SockRef::from(&stream), options);
            Box::new(SocketTransport::<std::net::TcpStream>::nonblocking(stream))
        } else {
            let stream = connect_sequential(&addrs, ct, |addr| async move {
                connect_blocking(addr, timeout, ct)
            })
            .await?;
            configure(&SockRef::from(&stream), options);
            Box::new(SocketTransport::blocking(stream))
        };
        Ok(Some(transport))
    }
}

/// Resolve `host` to socket addresses in resolver order.
pub async fn resolve(
    host: &str,
    port: u16,
    is_async: bool,
    ct: &CancellationToken,
) -> Result<Vec<SocketAddr>> {
    if ct.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let resolve_error = |source| TransportError::Resolve {
        host: host.to_string(),
        source,
    };

    let addrs: Vec<SocketAddr> = if is_async {
        tokio::select! {
            biased;
            () = ct.cancelled() => return Err(Error::Cancelled),
            result = tokio::net::lookup_host((host, port)) => result.map_err(resolve_error)?.collect(),
        }
    } else {
        (host, port).to_socket_addrs().map_err(resolve_error)?.collect()
    };

    if addrs.is_empty() {
        return Err(TransportError::NoAddresses(host.to_string()).into());
    }
    Ok(addrs)
}

/// Order addresses by family preference, keeping resolver order within a
/// family.
pub fn sort_addresses(addrs: &mut [SocketAddr], preference: IpAddressPreference) {
    addrs.sort_by(|a, b| preference.compare(&a.ip(), &b.ip()));
}

/// Try each address in order until one connects.
///
/// When every attempt fails with the same kind of error, that single error
/// is returned; otherwise all attempts are reported together.
pub async fn connect_sequential<T, F, Fut>(
    addrs: &[SocketAddr],
    ct: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut failures: Vec<ConnectAttempt> = Vec::with_capacity(addrs.len());
    for &addr in addrs {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tracing::debug!(%addr, "attempting TCP connection");
        match attempt(addr).await {
            Ok(stream) => return Ok(stream),
            Err(_) if ct.is_cancelled() => return Err(Error::Cancelled),
            Err(error) => {
                tracing::debug!(%addr, error = %error, "TCP connection attempt failed");
                failures.push(ConnectAttempt { addr, error });
            }
        }
    }

    let Some(first) = failures.first() else {
        return Err(TransportError::NoAddresses(String::new()).into());
    };
    let kind = first.error.kind();
    if failures.iter().all(|f| f.error.kind() == kind) {
        let first = failures.swap_remove(0);
        return Err(TransportError::Socket(first.error).into());
    }
    Err(TransportError::Aggregate(failures).into())
}

async fn connect_async(
    addr: SocketAddr,
    timeout: Duration,
    ct: &CancellationToken,
) -> io::Result<tokio::net::TcpStream> {
    tokio::select! {
        biased;
        () = ct.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "connect cancelled")),
        result = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)) => {
            result.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
        }
    }
}

/// Connect a blocking socket, polling so that cancellation is observed.
///
/// On cancellation the in-progress socket is dropped and an `Interrupted`
/// error is returned for the caller to translate.
pub fn connect_blocking(
    addr: SocketAddr,
    timeout: Duration,
    ct: &CancellationToken,
) -> io::Result<std::net::TcpStream> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if is_in_progress(&e) => {}
        Err(e) => return Err(e),
    }

    let deadline = Instant::now() + timeout;
    loop {
        if ct.is_cancelled() {
            drop(socket);
            return Err(io::Error::new(io::ErrorKind::Interrupted, "connect cancelled"));
        }
        if let Some(error) = socket.take_error()? {
            return Err(error);
        }
        match socket.peer_addr() {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotConnected || is_in_progress(&e) => {}
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    socket.set_nonblocking(false)?;
    Ok(socket.into())
}

fn is_in_progress(error: &io::Error) -> bool {
    #[cfg(unix)]
    if error.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    error.kind() == io::ErrorKind::WouldBlock
}

fn configure(socket: &SockRef<'_>, options: &ConnectionOptions) {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::warn!(error = %e, "failed to set TCP_NODELAY");
    }
    let keepalive = TcpKeepalive::new()
        .with_time(options.keep_alive_time)
        .with_interval(options.keep_alive_interval);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        tracing::warn!(error = %e, "failed to configure TCP keep-alive");
    } else {
        tracing::trace!(
            time = ?options.keep_alive_time,
            interval = ?options.keep_alive_interval,
            "TCP keep-alive configured"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::net::{IpAddr, TcpListener};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_sort_keeps_order_within_family() {
        let mut addrs = vec![
            addr("[::1]:1"),
            addr("10.0.0.1:1"),
            addr("[::2]:1"),
            addr("10.0.0.2:1"),
        ];
        sort_addresses(&mut addrs, IpAddressPreference::IPv4First);
        let ips: Vec<IpAddr> = addrs.iter().map(SocketAddr::ip).collect();
        assert_eq!(
            ips,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "10.0.0.2".parse().unwrap(),
                "::1".parse().unwrap(),
                "::2".parse().unwrap(),
            ]
        );

        sort_addresses(&mut addrs, IpAddressPreference::IPv6First);
        assert_eq!(addrs[0], addr("[::1]:1"));
        assert_eq!(addrs[2], addr("10.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_sequential_returns_last_success() {
        let addrs = [addr("10.0.0.1:1"), addr("10.0.0.2:1"), addr("10.0.0.3:1")];
        let mut tried = Vec::new();
        let result = connect_sequential(&addrs, &CancellationToken::new(), |a| {
            tried.push(a);
            async move {
                if a == addr("10.0.0.3:1") {
                    Ok(a)
                } else {
                    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, addr("10.0.0.3:1"));
        assert_eq!(tried, addrs);
    }

    #[tokio::test]
    async fn test_same_kind_failures_collapse() {
        let addrs = [addr("10.0.0.1:1"), addr("10.0.0.2:1")];
        let err = connect_sequential(&addrs, &CancellationToken::new(), |_| async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Socket(ref e)) if e.kind() == io::ErrorKind::ConnectionRefused
        ));
    }

    #[tokio::test]
    async fn test_mixed_failures_aggregate() {
        let addrs = [addr("10.0.0.1:1"), addr("10.0.0.2:1")];
        let err = connect_sequential(&addrs, &CancellationToken::new(), |a| async move {
            let kind = if a.port() == 1 && a.ip() == "10.0.0.1".parse::<IpAddr>().unwrap() {
                io::ErrorKind::ConnectionRefused
            } else {
                io::ErrorKind::TimedOut
            };
            Err::<(), _>(io::Error::from(kind))
        })
        .await
        .unwrap_err();
        match err {
            Error::Transport(TransportError::Aggregate(attempts)) => assert_eq!(attempts.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_blocking_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        let stream =
            connect_blocking(target, Duration::from_secs(5), &CancellationToken::new()).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), target);
    }

    #[test]
    fn test_blocking_connect_cancelled_up_front() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ct = CancellationToken::new();
        ct.cancel();
        let err = connect_blocking(listener.local_addr().unwrap(), Duration::from_secs(5), &ct)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
