//! TCP transport tests over loopback.
//!
//! Covers sequential address fallback, error collapsing, address family
//! ordering, and cancellation of in-flight connects in both modes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use mssql_codec::Transport;
use mssql_engine::connection::TransportHandler;
use mssql_engine::connection::transport::TcpHandler;
use mssql_engine::connection::transport::tcp::{connect_blocking, connect_sequential, sort_addresses};
use mssql_engine::{
    ConnectionOptions, DataSource, Error, IpAddressPreference, TransportError, block_on_sync,
};
use proptest::prelude::*;
use socket2::{Domain, Socket, Type};
use tokio_util::sync::CancellationToken;

const LONG_TIMEOUT: Duration = Duration::from_secs(5);

/// An address nothing listens on.
fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A listener whose accept queue is full, so new connects stay in progress.
///
/// The fillers must stay alive for as long as the listener is used.
#[cfg(target_os = "linux")]
fn saturated_listener() -> (Socket, SocketAddr, Vec<Socket>) {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&bind.into()).unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let fillers = (0..4)
        .map(|_| {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
            socket.set_nonblocking(true).unwrap();
            let _ = socket.connect(&addr.into());
            socket
        })
        .collect();
    std::thread::sleep(Duration::from_millis(50));
    (listener, addr, fillers)
}

fn options() -> ConnectionOptions {
    ConnectionOptions::new("tcp:127.0.0.1").with_sql_auth("sa", "secret")
}

#[test]
fn test_sequential_falls_back_to_live_address() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live = listener.local_addr().unwrap();
    let dead = closed_port();
    let ct = CancellationToken::new();

    let mut tried = Vec::new();
    let stream = block_on_sync(connect_sequential(&[dead, live], &ct, |addr| {
        tried.push(addr);
        let ct = ct.clone();
        async move { connect_blocking(addr, LONG_TIMEOUT, &ct) }
    }))
    .unwrap();

    assert_eq!(tried, vec![dead, live]);
    assert_eq!(stream.peer_addr().unwrap(), live);
}

#[test]
fn test_uniform_failures_collapse_to_one_error() {
    let ct = CancellationToken::new();
    let addrs = [closed_port(), closed_port()];

    let err = block_on_sync(connect_sequential(&addrs, &ct, |addr| {
        let ct = ct.clone();
        async move { connect_blocking(addr, LONG_TIMEOUT, &ct) }
    }))
    .unwrap_err();

    match err {
        Error::Transport(TransportError::Socket(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
        }
        other => panic!("expected a single socket error, got {other:?}"),
    }
}

#[test]
fn test_sync_handler_exchanges_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).unwrap();
        socket.write_all(b"pong").unwrap();
        buf
    });

    let ds = DataSource::parse(&format!("tcp:127.0.0.1,{port}")).unwrap();
    let ct = CancellationToken::new();
    let mut transport = block_on_sync(TcpHandler.open(&ds, &options(), false, &ct))
        .unwrap()
        .expect("TCP handler serves tcp data sources");

    block_on_sync(async { Ok(transport.write_all(b"ping", false).await) })
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = block_on_sync(async { Ok(transport.read(&mut buf[filled..], false).await) })
            .unwrap()
            .unwrap();
        assert!(n > 0, "server closed early");
        filled += n;
    }

    assert_eq!(&buf, b"pong");
    assert_eq!(&server.join().unwrap(), b"ping");
}

#[tokio::test]
async fn test_async_handler_exchanges_bytes() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(b"pong").await.unwrap();
        buf
    });

    let ds = DataSource::parse(&format!("tcp:127.0.0.1,{port}")).unwrap();
    let mut transport = TcpHandler
        .open(&ds, &options(), true, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();

    transport.write_all(b"ping", true).await.unwrap();
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..], true).await.unwrap();
        assert!(n > 0, "server closed early");
        filled += n;
    }

    assert_eq!(&buf, b"pong");
    assert_eq!(&server.await.unwrap(), b"ping");
}

#[tokio::test]
async fn test_handler_ignores_other_protocols() {
    let ds = DataSource::parse("np:\\\\.\\pipe\\sql\\query").unwrap();
    let opened = TcpHandler
        .open(&ds, &options(), true, &CancellationToken::new())
        .await
        .unwrap();
    assert!(opened.is_none());
}

#[cfg(target_os = "linux")]
#[test]
fn test_sync_connect_observes_cancellation() {
    let (_listener, addr, _fillers) = saturated_listener();
    let ct = CancellationToken::new();
    let canceller = {
        let ct = ct.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            ct.cancel();
        })
    };

    let started = Instant::now();
    let result = block_on_sync(connect_sequential(&[addr], &ct, |addr| {
        let ct = ct.clone();
        async move { connect_blocking(addr, LONG_TIMEOUT, &ct) }
    }));
    canceller.join().unwrap();

    assert!(matches!(result, Err(Error::Cancelled)), "got {result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_async_connect_observes_cancellation() {
    let (_listener, addr, _fillers) = saturated_listener();
    let ds = DataSource::parse(&format!("tcp:127.0.0.1,{}", addr.port())).unwrap();
    let ct = CancellationToken::new();
    let options = options().with_connect_timeout(LONG_TIMEOUT);
    {
        let ct = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ct.cancel();
        });
    }

    let started = Instant::now();
    let err = TcpHandler.open(&ds, &options, true, &ct).await.unwrap_err();

    assert!(err.is_cancelled(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

fn socket_addr(v4: bool, n: u8) -> SocketAddr {
    let ip = if v4 {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    } else {
        IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, u16::from(n)))
    };
    SocketAddr::new(ip, 1433)
}

fn preference() -> impl Strategy<Value = IpAddressPreference> {
    prop_oneof![
        Just(IpAddressPreference::IPv4First),
        Just(IpAddressPreference::IPv6First),
        Just(IpAddressPreference::UsePlatformDefault),
    ]
}

proptest! {
    #[test]
    fn prop_sort_groups_families_and_keeps_resolver_order(
        entries in prop::collection::vec((any::<bool>(), any::<u8>()), 0..16),
        pref in preference(),
    ) {
        let original: Vec<SocketAddr> = entries.iter().map(|&(v4, n)| socket_addr(v4, n)).collect();
        let mut sorted = original.clone();
        sort_addresses(&mut sorted, pref);

        let family = |addrs: &[SocketAddr], v4: bool| -> Vec<SocketAddr> {
            addrs.iter().copied().filter(|a| a.is_ipv4() == v4).collect()
        };
        prop_assert_eq!(family(&sorted, true), family(&original, true));
        prop_assert_eq!(family(&sorted, false), family(&original, false));

        match pref {
            IpAddressPreference::UsePlatformDefault => prop_assert_eq!(&sorted, &original),
            IpAddressPreference::IPv4First | IpAddressPreference::IPv6First => {
                let preferred_v4 = pref == IpAddressPreference::IPv4First;
                let boundary = sorted
                    .iter()
                    .position(|a| a.is_ipv4() != preferred_v4)
                    .unwrap_or(sorted.len());
                prop_assert!(sorted[boundary..].iter().all(|a| a.is_ipv4() != preferred_v4));
            }
        }
    }
}
