//! Connection pipeline scenarios against a scripted server.
//!
//! These tests drive the real pre-login, TLS negotiation and login stages over
//! an in-memory transport. The TLS handshake is replaced by a pass-through
//! authenticator so the server script can stay in cleartext.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mssql_codec::{BoxTransport, MemoryTransport, Transport};
use mssql_engine::connection::{
    DataSourceHandler, LoginHandler, PreloginHandler, TransportChain, TransportHandler,
};
use mssql_engine::{
    ConnectionHandlerContext, ConnectionOptions, ConnectionPipeline, DataSource, EncryptOption,
    Error, NegotiatedEncryption, ParserState, block_on_sync,
};
use mssql_tls::TlsAuthenticator;
use parking_lot::Mutex;
use tds_protocol::{
    DecodeContext, Done, DoneStatus, EncryptionLevel, LoginAck, PacketType, PreLogin,
    ServerMessage, TdsVersion, Token, frame_single,
};
use tokio_util::sync::CancellationToken;

/// Hands the same scripted transport to the pipeline for every connect.
#[derive(Debug, Clone)]
struct ScriptedTransport(MemoryTransport);

#[async_trait]
impl TransportHandler for ScriptedTransport {
    async fn open(
        &self,
        _data_source: &DataSource,
        _options: &ConnectionOptions,
        _is_async: bool,
        _ct: &CancellationToken,
    ) -> mssql_engine::Result<Option<BoxTransport>> {
        Ok(Some(Box::new(self.0.clone())))
    }
}

/// Stands in for a TLS session: bytes pass through untouched, but the layer
/// can be removed like a real one.
#[derive(Debug)]
struct PassthroughTls(BoxTransport);

#[async_trait]
impl Transport for PassthroughTls {
    async fn read(&mut self, buf: &mut [u8], is_async: bool) -> std::io::Result<usize> {
        self.0.read(buf, is_async).await
    }

    async fn write_all(&mut self, buf: &[u8], is_async: bool) -> std::io::Result<()> {
        self.0.write_all(buf, is_async).await
    }

    async fn flush(&mut self, is_async: bool) -> std::io::Result<()> {
        self.0.flush(is_async).await
    }

    fn into_inner(self: Box<Self>) -> Option<BoxTransport> {
        Some(self.0)
    }
}

#[derive(Debug, Default)]
struct PassthroughAuthenticator {
    handshakes: Mutex<usize>,
}

#[async_trait]
impl TlsAuthenticator for PassthroughAuthenticator {
    async fn authenticate(
        &self,
        transport: BoxTransport,
        _target_host: &str,
        _alpn: &[&[u8]],
        _is_async: bool,
        _ct: &CancellationToken,
    ) -> mssql_tls::Result<BoxTransport> {
        *self.handshakes.lock() += 1;
        Ok(Box::new(PassthroughTls(transport)))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn prelogin_response(encryption: EncryptionLevel) -> Bytes {
    let payload = PreLogin::new()
        .with_version(0x1000_07D0, 0)
        .with_encryption(encryption)
        .encode();
    frame_single(PacketType::PreLogin, &payload, 1).unwrap()
}

fn login_response(tokens: &[Token]) -> Bytes {
    let ctx = DecodeContext::new(TdsVersion::V7_4);
    let mut payload = BytesMut::new();
    for token in tokens {
        token.encode(&mut payload, &ctx).unwrap();
    }
    frame_single(PacketType::TabularResult, &payload, 1).unwrap()
}

fn login_ack() -> Token {
    Token::LoginAck(LoginAck {
        interface: 1,
        tds_version: TdsVersion::V7_4,
        prog_name: "Microsoft SQL Server".into(),
        major: 16,
        minor: 0,
        build: 2000,
    })
}

fn done() -> Token {
    Token::Done(Done {
        status: DoneStatus::empty(),
        ..Done::default()
    })
}

struct Scenario {
    transport: MemoryTransport,
    authenticator: Arc<PassthroughAuthenticator>,
    infos: Arc<Mutex<Vec<String>>>,
    pipeline: ConnectionPipeline,
}

impl Scenario {
    fn new(server_encryption: EncryptionLevel, login_tokens: &[Token]) -> Self {
        init_tracing();
        let transport = MemoryTransport::with_reads([
            prelogin_response(server_encryption),
            login_response(login_tokens),
        ]);
        let pipeline = ConnectionPipeline::new()
            .with(DataSourceHandler)
            .with(TransportChain::new().with(ScriptedTransport(transport.clone())))
            .with(PreloginHandler)
            .with(LoginHandler);
        Self {
            transport,
            authenticator: Arc::new(PassthroughAuthenticator::default()),
            infos: Arc::new(Mutex::new(Vec::new())),
            pipeline,
        }
    }

    fn context(&self, encrypt: EncryptOption) -> ConnectionHandlerContext {
        let infos = Arc::clone(&self.infos);
        let options = ConnectionOptions::new("tcp:dbhost,1433")
            .with_sql_auth("sa", "secret")
            .with_encrypt(encrypt)
            .with_tls_authenticator(self.authenticator.clone())
            .with_info_message_handler(move |message| {
                infos.lock().push(message.message.clone());
            });
        ConnectionHandlerContext::new(options)
    }
}

fn ack_info_error_done() -> Vec<Token> {
    vec![
        login_ack(),
        Token::Info(ServerMessage::new(5701, 0, "0")),
        Token::Error(ServerMessage::new(50000, 15, "Error 1")),
        done(),
    ]
}

fn assert_logged_in_with_error(scenario: &Scenario, ctx: &ConnectionHandlerContext) {
    let session = ctx.session.as_ref().expect("login stores the session");
    assert_eq!(session.state(), ParserState::OpenLoggedIn);
    assert!(session.session().login_ack.is_some());

    match ctx.error.as_ref() {
        Some(Error::Server(errors)) => {
            assert!(errors.to_string().contains("Error 1"));
            assert!(errors.contains(50000));
            assert!(!errors.is_fatal());
        }
        other => panic!("expected a server error, got {other:?}"),
    }
    assert_eq!(*scenario.infos.lock(), vec!["0".to_string()]);
    assert_eq!(*scenario.authenticator.handshakes.lock(), 1);
    assert_eq!(scenario.transport.unread(), 0);
}

#[tokio::test]
async fn test_login_reports_server_error_and_info() {
    let scenario = Scenario::new(EncryptionLevel::On, &ack_info_error_done());
    let mut ctx = scenario.context(EncryptOption::Mandatory);

    scenario
        .pipeline
        .handle(&mut ctx, true, &CancellationToken::new())
        .await;

    assert_eq!(ctx.encryption, Some(NegotiatedEncryption::Full));
    assert_logged_in_with_error(&scenario, &ctx);
}

#[test]
fn test_login_reports_server_error_and_info_sync() {
    let scenario = Scenario::new(EncryptionLevel::On, &ack_info_error_done());
    let mut ctx = scenario.context(EncryptOption::Mandatory);
    let ct = CancellationToken::new();

    block_on_sync(async {
        scenario.pipeline.handle(&mut ctx, false, &ct).await;
        Ok(())
    })
    .unwrap();

    assert_logged_in_with_error(&scenario, &ctx);
    let (sync_calls, async_calls) = scenario.transport.call_counts();
    assert!(sync_calls > 0);
    assert_eq!(async_calls, 0);
}

#[tokio::test]
async fn test_login_only_encryption_drops_tls_after_login() {
    let scenario = Scenario::new(EncryptionLevel::Off, &[login_ack(), done()]);
    let mut ctx = scenario.context(EncryptOption::Optional);

    scenario
        .pipeline
        .handle(&mut ctx, true, &CancellationToken::new())
        .await;

    assert!(ctx.error.is_none(), "unexpected error: {:?}", ctx.error);
    assert_eq!(ctx.encryption, Some(NegotiatedEncryption::LoginOnly));
    assert!(ctx.framing_switch.is_none());
    assert_eq!(*scenario.authenticator.handshakes.lock(), 1);

    let session = ctx.session.take().unwrap();
    assert_eq!(session.state(), ParserState::OpenLoggedIn);
    let transport = session.close().into_transport();
    // The TLS layers are gone; the raw transport wraps nothing.
    assert!(transport.into_inner().is_none());
}

#[tokio::test]
async fn test_warnings_alone_do_not_fail_login() {
    let tokens = [
        login_ack(),
        Token::Info(ServerMessage::new(5701, 0, "Changed database context to 'master'.")),
        done(),
    ];
    let scenario = Scenario::new(EncryptionLevel::On, &tokens);
    // No handler: informational messages become warnings.
    let options = ConnectionOptions::new("tcp:dbhost,1433")
        .with_sql_auth("sa", "secret")
        .with_tls_authenticator(scenario.authenticator.clone());

    let session = scenario
        .pipeline
        .connect(options, true, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.state(), ParserState::OpenLoggedIn);
    assert!(scenario.infos.lock().is_empty());
}

#[tokio::test]
async fn test_missing_login_ack_is_rejected() {
    let scenario = Scenario::new(EncryptionLevel::On, &[done()]);
    let options = ConnectionOptions::new("tcp:dbhost,1433")
        .with_sql_auth("sa", "secret")
        .with_tls_authenticator(scenario.authenticator.clone());

    let err = scenario
        .pipeline
        .connect(options, true, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Negotiation(mssql_engine::NegotiationError::LoginNotAcknowledged)
    ));
}

#[tokio::test]
async fn test_cancelled_connect_stops_before_transport() {
    let scenario = Scenario::new(EncryptionLevel::On, &ack_info_error_done());
    let ct = CancellationToken::new();
    ct.cancel();
    let mut ctx = scenario.context(EncryptOption::Mandatory);

    scenario.pipeline.handle(&mut ctx, true, &ct).await;

    assert!(ctx.error.as_ref().unwrap().is_cancelled());
    assert!(ctx.transport.is_none());
    assert!(scenario.transport.written().is_empty());
}
