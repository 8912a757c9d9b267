//! LOGIN7 stage.

use std::sync::Arc;

use async_trait::async_trait;
use mssql_codec::{BoxTransport, TdsStream};
use tds_protocol::feature::{DATA_CLASSIFICATION_VERSION_MAX, FeatureId, FeatureRequest};
use tds_protocol::login7::Login7;
use tds_protocol::packet::PacketType;
use tds_protocol::token::DecodeContext;
use tokio_util::sync::CancellationToken;

use super::ConnectionHandler;
use super::context::{ConnectionHandlerContext, NegotiatedEncryption};
use crate::config::ConnectionOptions;
use crate::datasource::DataSource;
use crate::error::{Error, NegotiationError, Result};
use crate::parser::{RunBehavior, TdsContext};

/// Features requested at login.
pub const REQUESTED_FEATURES: [FeatureId; 4] = [
    FeatureId::GlobalTransactions,
    FeatureId::DataClassification,
    FeatureId::Utf8Support,
    FeatureId::AzureSqlSupport,
];

/// Sends LOGIN7 and runs the login response to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginHandler;

impl LoginHandler {
    /// The LOGIN7 message for `options`.
    pub fn build_login(options: &ConnectionOptions, data_source: &DataSource) -> Result<Login7> {
        let user = options
            .user
            .as_deref()
            .ok_or_else(|| Error::Config("SQL authentication requires a user".into()))?;
        let mut login = Login7::new()
            .with_tds_version(options.encrypt.tds_version())
            .with_sql_auth(user, options.password.as_deref().unwrap_or_default())
            .with_app_name(options.application_name.as_str())
            .with_server_name(data_source.server_name.as_str())
            .with_packet_size(options.packet_size);
        if let Some(database) = &options.database {
            login = login.with_database(database.as_str());
        }
        if let Some(workstation) = &options.workstation_id {
            login = login.with_hostname(workstation.as_str());
        }
        for id in REQUESTED_FEATURES {
            let request = match id {
                FeatureId::DataClassification => {
                    FeatureRequest::versioned(id, DATA_CLASSIFICATION_VERSION_MAX)
                }
                _ => FeatureRequest::flag(id),
            };
            login = login.with_feature(request);
        }
        Ok(login)
    }

    /// Strip TLS and the TLS-over-TDS wrapper after a login-only handshake.
    fn drop_tls(transport: BoxTransport) -> Result<BoxTransport> {
        transport
            .into_inner()
            .and_then(|framed| framed.into_inner())
            .ok_or_else(|| {
                Error::Config("login-only encryption needs an unwrappable TLS transport".into())
            })
    }
}

#[async_trait]
impl ConnectionHandler for LoginHandler {
    async fn handle(
        &self,
        ctx: &mut ConnectionHandlerContext,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        let login = Self::build_login(&ctx.options, ctx.data_source()?)?;
        let encryption = ctx.encryption.unwrap_or(NegotiatedEncryption::None);

        let mut stream = TdsStream::new(ctx.take_transport()?);
        stream
            .write_message(PacketType::Tds7Login, &login.encode(), is_async, ct)
            .await?;
        tracing::debug!(encryption = ?encryption, "LOGIN7 sent");

        if encryption == NegotiatedEncryption::LoginOnly {
            let raw = Self::drop_tls(stream.into_transport())?;
            ctx.framing_switch = None;
            stream = TdsStream::new(raw);
            tracing::debug!("continuing in cleartext after login-only encryption");
        }

        let decode = DecodeContext::new(login.tds_version);
        let mut session = TdsContext::new(stream, decode);
        if let Some(handler) = &ctx.options.info_message_handler {
            let handler = Arc::clone(handler);
            session.set_info_listener(move |message| handler(message));
        }

        let outcome = session.run(RunBehavior::UNTIL_DONE, is_async, ct).await;
        let acknowledged = session.session().login_ack.is_some();
        if let Some(routing) = &session.session().routing {
            tracing::info!(host = %routing.host, port = routing.port, "server requested routing");
        }
        ctx.session = Some(session);

        match outcome {
            Ok(()) => {}
            // Warnings alone do not fail the login.
            Err(Error::Server(messages)) if acknowledged && messages.errors().next().is_none() => {
                for message in messages.messages() {
                    tracing::info!(
                        number = message.number,
                        message = %message.message,
                        "login warning"
                    );
                }
            }
            Err(e) => return Err(e),
        }
        if !acknowledged {
            return Err(NegotiationError::LoginNotAcknowledged.into());
        }
        tracing::info!("login acknowledged");
        Ok(())
    }
}
