//! Per-token effects on session state.
//!
//! Processors only mutate the [`TdsContext`]; they never touch the
//! transport.

use tds_protocol::feature::{DATA_CLASSIFICATION_VERSION_MAX, FeatureId};
use tds_protocol::token::{
    Done, EnvChange, EnvChangeType, EnvChangeValue, FeatureExtAck, LoginAck, ServerMessage, Token,
    TokenType,
};

use super::context::{ParserState, Routing, RunBehavior, StatementResult, TdsContext};
use crate::error::{NegotiationError, Result};

/// Apply one token to the session.
pub fn process(token: Token, ctx: &mut TdsContext, behavior: &mut RunBehavior) -> Result<()> {
    let token_type = token.token_type();
    match token {
        Token::Error(msg) => process_message(msg, TokenType::Error, ctx, behavior),
        Token::Info(msg) => process_message(msg, TokenType::Info, ctx, behavior),
        Token::LoginAck(ack) => process_login_ack(ack, ctx),
        Token::FeatureExtAck(ack) => return process_feature_ext_ack(ack, ctx),
        Token::FedAuthInfo(info) => {
            tracing::debug!(sts_url = %info.sts_url, spn = %info.spn, "federated authentication info");
            ctx.session.fed_auth_info = Some(info);
        }
        Token::DataClassification(classification) => {
            ctx.session.data_classification = Some(classification);
        }
        Token::EnvChange(env) => process_env_change(env, ctx),
        Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
            process_done(token_type, done, ctx);
        }
        Token::ReturnStatus(status) => ctx.session.return_status = Some(status),
        Token::Order(order) => ctx.session.order = order.columns,
        Token::SessionState(state) => ctx.session.session_state.push(state),
        Token::Sspi(challenge) => ctx.session.sspi = Some(challenge),
    }
    Ok(())
}

fn process_message(
    msg: ServerMessage,
    token: TokenType,
    ctx: &mut TdsContext,
    behavior: &mut RunBehavior,
) {
    if msg.is_fatal() {
        tracing::error!(
            number = msg.number,
            class = msg.class,
            message = %msg.message,
            "fatal server error"
        );
        ctx.errors.add_error(msg);
        ctx.mark_broken();
        behavior.remove(RunBehavior::RETURN_IMMEDIATELY);
        behavior.insert(RunBehavior::UNTIL_DONE);
    } else if msg.is_error() {
        tracing::debug!(number = msg.number, class = msg.class, message = %msg.message, "server error");
        ctx.errors.add_error(msg);
    } else if token == TokenType::Info {
        tracing::debug!(number = msg.number, message = %msg.message, "server info message");
        ctx.errors.add_info_event(msg);
    } else {
        ctx.errors.add_warning(msg);
    }
}

fn process_login_ack(ack: LoginAck, ctx: &mut TdsContext) {
    tracing::info!(
        tds_version = %ack.tds_version,
        prog_name = %ack.prog_name,
        major = ack.major,
        minor = ack.minor,
        build = ack.build,
        "login acknowledged"
    );
    ctx.decode.tds_version = ack.tds_version;
    if ctx.state == ParserState::OpenNotLoggedIn {
        ctx.state = ParserState::OpenLoggedIn;
    }
    ctx.session.login_ack = Some(ack);
}

fn process_feature_ext_ack(ack: FeatureExtAck, ctx: &mut TdsContext) -> Result<()> {
    if let Some(feature) = ack.get(FeatureId::DataClassification) {
        let version = feature.data.first().copied().unwrap_or(0);
        let enabled = feature.data.get(1).is_none_or(|&b| b != 0);
        if version == 0 || version > DATA_CLASSIFICATION_VERSION_MAX {
            return Err(NegotiationError::InvalidResponse(format!(
                "unsupported data classification version {version}"
            ))
            .into());
        }
        ctx.decode.data_classification_version = if enabled { version } else { 0 };
        tracing::debug!(version, enabled, "data classification acknowledged");
    }
    for feature in &ack.features {
        tracing::debug!(feature = ?feature.id, len = feature.data.len(), "feature acknowledged");
    }
    ctx.session.features = Some(ack);
    Ok(())
}

fn process_env_change(env: EnvChange, ctx: &mut TdsContext) {
    match env.env_type {
        EnvChangeType::Database => {
            if let Some(database) = env.new_string() {
                tracing::debug!(database = %database, "database changed");
                ctx.session.database = Some(database.to_owned());
            }
        }
        EnvChangeType::Language => {
            if let Some(language) = env.new_string() {
                tracing::debug!(language = %language, "language changed");
                ctx.session.language = Some(language.to_owned());
            }
        }
        EnvChangeType::PacketSize => match env.packet_size() {
            Some(size) => ctx.stream.set_packet_size(size as usize),
            None => tracing::warn!(value = ?env.new_value, "ignoring invalid packet size change"),
        },
        EnvChangeType::SqlCollation => {
            if let EnvChangeValue::Binary(collation) = env.new_value {
                ctx.session.collation = Some(collation);
            }
        }
        EnvChangeType::Routing => {
            if let EnvChangeValue::Routing { port, server, .. } = env.new_value {
                tracing::info!(host = %server, port, "routing redirect received");
                ctx.session.routing = Some(Routing { host: server, port });
            }
        }
        EnvChangeType::BeginTransaction => {
            if let EnvChangeValue::Binary(data) = &env.new_value {
                if let Some(bytes) = data.get(..8) {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    let descriptor = u64::from_le_bytes(raw);
                    tracing::debug!(descriptor, "transaction started");
                    ctx.session.transaction_descriptor = descriptor;
                }
            }
        }
        EnvChangeType::CommitTransaction
        | EnvChangeType::RollbackTransaction
        | EnvChangeType::TransactionEnded => {
            tracing::debug!(env_type = ?env.env_type, "transaction ended");
            ctx.session.transaction_descriptor = 0;
        }
        other => tracing::debug!(env_type = ?other, "environment change"),
    }
}

fn process_done(token: TokenType, done: Done, ctx: &mut TdsContext) {
    if done.is_attention_ack() {
        ctx.session.attention_acknowledged = true;
    }
    // After a fatal error the rest of the response is drained, not delivered.
    if ctx.errors.has_fatal_error() {
        tracing::trace!(token = ?token, "discarding completion after fatal error");
        return;
    }
    ctx.session.statement_results.push(StatementResult {
        token,
        rows: done.count(),
    });
}
