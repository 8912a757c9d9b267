//! The read-token/process-token loop for one unit of work.

use tds_protocol::token::{MIN_ERROR_CLASS, ServerMessage, Token};
use tokio_util::sync::CancellationToken;

use super::context::{RunBehavior, TdsContext};
use super::processor;
use crate::error::{Error, Result};

/// Error number reported when a request times out.
pub const TIMEOUT_ERROR_NUMBER: i32 = -2;

const TIMEOUT_MESSAGE: &str = "Execution Timeout Expired. The timeout period elapsed prior to \
                               completion of the operation or the server is not responding.";

impl TdsContext {
    /// Read and process tokens until the unit of work completes.
    ///
    /// Server errors and warnings are accumulated and raised once, as a
    /// single [`Error::Server`], after the loop ends. Any other failure
    /// (I/O, malformed stream, cancellation) leaves the session broken.
    pub async fn run(
        &mut self,
        behavior: RunBehavior,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        if !self.state.is_usable() {
            return Err(Error::SessionBroken);
        }

        let mut behavior = behavior;
        if let Err(e) = self.drive(&mut behavior, is_async, ct).await {
            tracing::debug!(error = %e, "run loop aborted");
            self.mark_broken();
            return Err(e);
        }

        if !self.errors.accumulate_info_events() {
            self.flush_info_events();
        }
        self.raise_accumulated(behavior)
    }

    async fn drive(
        &mut self,
        behavior: &mut RunBehavior,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        loop {
            let timed_out = self.timeout_expired();
            if timed_out {
                behavior.insert(RunBehavior::ATTENTION);
            }
            if behavior.contains(RunBehavior::ATTENTION) {
                return self.attention(behavior, timed_out, is_async, ct).await;
            }

            if !self.errors.accumulate_info_events() {
                self.flush_info_events();
            }

            let Some(token) = self
                .reader
                .next_token(&mut self.stream, &self.decode, is_async, ct)
                .await?
            else {
                return Ok(());
            };
            processor::process(token, self, behavior)?;

            if !self.has_pending_data() || behavior.contains(RunBehavior::RETURN_IMMEDIATELY) {
                return Ok(());
            }
        }
    }

    /// Send an attention and drain up to its acknowledgment.
    async fn attention(
        &mut self,
        behavior: &mut RunBehavior,
        timed_out: bool,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!(timed_out, "sending attention");
        self.deadline = None;
        self.errors.store_pre_attention();
        self.session.attention_acknowledged = false;
        self.stream.send_attention(is_async, ct).await?;

        loop {
            match self
                .reader
                .next_token(&mut self.stream, &self.decode, is_async, ct)
                .await?
            {
                Some(Token::Done(done)) if done.is_attention_ack() => {
                    self.session.attention_acknowledged = true;
                    break;
                }
                Some(token) => processor::process(token, self, behavior)?,
                // The interrupted response ended; the acknowledgment follows.
                None => self.stream.begin_response(),
            }
        }
        tracing::debug!("attention acknowledged");

        if timed_out {
            self.errors.add_error(ServerMessage::new(
                TIMEOUT_ERROR_NUMBER,
                MIN_ERROR_CLASS,
                TIMEOUT_MESSAGE,
            ));
        }
        Ok(())
    }

    fn flush_info_events(&mut self) {
        let events = self.errors.take_pending_info_events();
        if events.is_empty() {
            return;
        }
        match self.info_listener.as_mut() {
            Some(listener) => events.iter().for_each(|event| listener(event)),
            None => events
                .into_iter()
                .for_each(|event| self.errors.add_warning(event)),
        }
    }

    fn raise_accumulated(&mut self, behavior: RunBehavior) -> Result<()> {
        if !self.errors.has_errors_or_warnings() {
            return Ok(());
        }
        let collected = self.errors.take_all();
        let discard = behavior.contains(RunBehavior::CLEAN)
            && !behavior.contains(RunBehavior::ATTENTION)
            && !collected.is_fatal();
        if discard {
            tracing::debug!(
                discarded = collected.messages().len(),
                "clean run discarded server messages"
            );
            return Ok(());
        }
        Err(Error::Server(collected))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};
    use mssql_codec::{MemoryTransport, TdsStream};
    use parking_lot::Mutex;
    use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
    use tds_protocol::token::{DecodeContext, Done, DoneStatus};

    use super::*;
    use crate::parser::context::ParserState;
    use crate::sync::block_on_sync;

    fn response(tokens: &[Token]) -> Bytes {
        let mut payload = BytesMut::new();
        for token in tokens {
            token.encode(&mut payload, &DecodeContext::default()).unwrap();
        }
        let mut out = BytesMut::new();
        PacketHeader::new(
            PacketType::TabularResult,
            PacketStatus::END_OF_MESSAGE,
            (PACKET_HEADER_SIZE + payload.len()) as u16,
        )
        .encode(&mut out);
        out.extend_from_slice(&payload);
        out.freeze()
    }

    fn done(status: DoneStatus, rows: u64) -> Token {
        Token::Done(Done {
            status,
            cur_cmd: 0xC1,
            row_count: rows,
        })
    }

    fn context(transport: &MemoryTransport) -> TdsContext {
        let stream = TdsStream::new(Box::new(transport.clone()));
        TdsContext::new(stream, DecodeContext::default())
    }

    #[tokio::test]
    async fn test_consolidated_error_order() {
        let transport = MemoryTransport::with_reads([response(&[
            Token::Info(ServerMessage::new(100, 0, "info 1")),
            Token::Error(ServerMessage::new(201, 16, "error 1")),
            done(DoneStatus::MORE | DoneStatus::ERROR, 0),
            Token::Error(ServerMessage::new(102, 10, "warning 1")),
            Token::Error(ServerMessage::new(202, 16, "error 2")),
            done(DoneStatus::COUNT, 3),
        ])]);
        let mut ctx = context(&transport);

        let err = ctx
            .run(RunBehavior::UNTIL_DONE, true, &CancellationToken::new())
            .await
            .unwrap_err();
        let errors = err.server_errors().unwrap();
        let numbers: Vec<i32> = errors.messages().iter().map(|m| m.number).collect();
        assert_eq!(numbers, vec![201, 202, 100, 102]);
        assert_eq!(
            errors.to_string(),
            "error 1\nerror 2\ninfo 1\nwarning 1"
        );
        assert_eq!(ctx.session().statement_results.len(), 2);
        assert_eq!(ctx.session().statement_results[1].rows, Some(3));
        assert!(ctx.state().is_usable());
    }

    #[tokio::test]
    async fn test_fatal_error_drains_then_raises() {
        let transport = MemoryTransport::with_reads([response(&[
            done(DoneStatus::MORE | DoneStatus::COUNT, 1),
            Token::Error(ServerMessage::new(596, 21, "session killed")),
            done(DoneStatus::MORE | DoneStatus::COUNT, 2),
            Token::Info(ServerMessage::new(0, 0, "late info")),
            done(DoneStatus::ERROR, 0),
        ])]);
        let mut ctx = context(&transport);
        let ct = CancellationToken::new();

        ctx.run(RunBehavior::RETURN_IMMEDIATELY, true, &ct)
            .await
            .unwrap();
        // One token at fatal severity overrides return-immediately.
        let err = ctx
            .run(RunBehavior::RETURN_IMMEDIATELY, true, &ct)
            .await
            .unwrap_err();
        let errors = err.server_errors().unwrap();
        assert!(errors.is_fatal());
        assert!(errors.contains(0));
        assert!(!ctx.has_pending_data());
        assert_eq!(ctx.state(), ParserState::Broken);
        assert_eq!(ctx.session().statement_results.len(), 1);

        let err = ctx.run(RunBehavior::UNTIL_DONE, true, &ct).await.unwrap_err();
        assert!(matches!(err, Error::SessionBroken));
    }

    #[tokio::test]
    async fn test_return_immediately_stops_after_one_token() {
        let transport = MemoryTransport::with_reads([response(&[
            done(DoneStatus::MORE | DoneStatus::COUNT, 1),
            done(DoneStatus::COUNT, 2),
        ])]);
        let mut ctx = context(&transport);
        let ct = CancellationToken::new();

        ctx.run(RunBehavior::RETURN_IMMEDIATELY, true, &ct)
            .await
            .unwrap();
        assert!(ctx.has_pending_data());
        ctx.run(RunBehavior::UNTIL_DONE, true, &ct).await.unwrap();
        assert!(!ctx.has_pending_data());
        assert_eq!(ctx.session().statement_results.len(), 2);
    }

    #[test]
    fn test_sync_mode_info_listener() {
        let transport = MemoryTransport::with_reads([response(&[
            Token::Info(ServerMessage::new(5701, 0, "Changed database context")),
            done(DoneStatus::empty(), 0),
        ])]);
        let mut ctx = context(&transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.set_info_listener(move |msg| sink.lock().push(msg.message.clone()));

        block_on_sync(ctx.run(RunBehavior::UNTIL_DONE, false, &CancellationToken::new())).unwrap();
        assert_eq!(*seen.lock(), vec!["Changed database context".to_string()]);
        let (sync_calls, async_calls) = transport.call_counts();
        assert!(sync_calls > 0);
        assert_eq!(async_calls, 0);
    }

    #[tokio::test]
    async fn test_clean_run_discards_messages() {
        let transport = MemoryTransport::with_reads([response(&[
            Token::Error(ServerMessage::new(3621, 16, "statement terminated")),
            done(DoneStatus::ERROR, 0),
        ])]);
        let mut ctx = context(&transport);
        ctx.run(RunBehavior::CLEAN, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!ctx.errors().has_errors_or_warnings());
    }

    #[tokio::test]
    async fn test_timeout_sends_attention_and_reports() {
        let transport = MemoryTransport::with_reads([response(&[
            Token::Error(ServerMessage::new(3621, 16, "cancelled mid-batch")),
            done(DoneStatus::ATTN, 0),
        ])]);
        let mut ctx = context(&transport);
        ctx.set_timeout(Some(Duration::ZERO));

        let err = ctx
            .run(RunBehavior::UNTIL_DONE, true, &CancellationToken::new())
            .await
            .unwrap_err();

        let written = transport.written();
        assert_eq!(written.len(), PACKET_HEADER_SIZE);
        assert_eq!(written[0], PacketType::Attention as u8);

        let errors = err.server_errors().unwrap();
        assert_eq!(errors.messages()[0].number, 3621);
        assert_eq!(errors.messages()[1].number, TIMEOUT_ERROR_NUMBER);
        assert!(ctx.session().attention_acknowledged);
        assert!(!ctx.timeout_expired());
    }

    #[tokio::test]
    async fn test_cancellation_breaks_session() {
        let transport = MemoryTransport::with_reads([response(&[done(DoneStatus::empty(), 0)])]);
        let mut ctx = context(&transport);
        let ct = CancellationToken::new();
        ct.cancel();

        let err = ctx.run(RunBehavior::UNTIL_DONE, true, &ct).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(ctx.state(), ParserState::Broken);
    }
}
