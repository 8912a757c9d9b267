//! Incremental token decoding over packet payloads.

use bytes::{Buf, BytesMut};
use mssql_codec::TdsStream;
use tds_protocol::ProtocolError;
use tds_protocol::token::{DecodeContext, Token};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Buffers packet payloads until a whole token can be decoded.
///
/// Tokens may straddle packet boundaries. The reader decodes from the front
/// of its buffer and, when the decoder reports that more bytes are needed,
/// pulls the next payload from the stream and tries again from the same
/// position.
#[derive(Debug, Default)]
pub struct TokenReader {
    buf: BytesMut,
}

impl TokenReader {
    /// Whether undecoded bytes are buffered.
    #[must_use]
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Read the next token of the current response.
    ///
    /// Returns `None` when the response message ended on a token boundary.
    pub async fn next_token(
        &mut self,
        stream: &mut TdsStream,
        ctx: &DecodeContext,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Option<Token>> {
        loop {
            if !self.buf.is_empty() {
                let mut view = &self.buf[..];
                let before = view.len();
                match Token::decode(&mut view, ctx) {
                    Ok(token) => {
                        let consumed = before - view.len();
                        self.buf.advance(consumed);
                        tracing::trace!(token = ?token.token_type(), consumed, "decoded token");
                        return Ok(Some(token));
                    }
                    Err(e) if e.is_incomplete() => {}
                    Err(e) => return Err(e.into()),
                }
            }

            match stream.read_payload(is_async, ct).await? {
                Some(payload) => self.buf.extend_from_slice(&payload),
                None if self.buf.is_empty() => return Ok(None),
                None => {
                    tracing::debug!(buffered = self.buf.len(), "response ended inside a token");
                    return Err(ProtocolError::UnexpectedEof.into());
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mssql_codec::MemoryTransport;
    use tds_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
    use tds_protocol::token::ServerMessage;

    fn packet(status: PacketStatus, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        PacketHeader::new(
            PacketType::TabularResult,
            status,
            (PACKET_HEADER_SIZE + payload.len()) as u16,
        )
        .encode(&mut out);
        out.extend_from_slice(payload);
        out.freeze()
    }

    fn error_token() -> Vec<u8> {
        let mut out = BytesMut::new();
        Token::Error(ServerMessage::new(1, 16, "Error 1"))
            .encode(&mut out, &DecodeContext::default())
            .unwrap();
        out.to_vec()
    }

    #[tokio::test]
    async fn test_token_split_across_packets() {
        let token = error_token();
        let (head, tail) = token.split_at(5);
        let transport = MemoryTransport::with_reads([
            packet(PacketStatus::NORMAL, head),
            packet(PacketStatus::END_OF_MESSAGE, tail),
        ]);
        let mut stream = TdsStream::new(Box::new(transport));
        let mut reader = TokenReader::default();
        let ct = CancellationToken::new();
        let ctx = DecodeContext::default();

        let token = reader.next_token(&mut stream, &ctx, true, &ct).await.unwrap();
        let Some(Token::Error(msg)) = token else {
            panic!("expected error token");
        };
        assert_eq!(msg.message, "Error 1");
        assert!(!reader.has_buffered());
        assert!(reader.next_token(&mut stream, &ctx, true, &ct).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_message_ending_inside_token_is_error() {
        let token = error_token();
        let transport =
            MemoryTransport::with_reads([packet(PacketStatus::END_OF_MESSAGE, &token[..4])]);
        let mut stream = TdsStream::new(Box::new(transport));
        let mut reader = TokenReader::default();

        let err = reader
            .next_token(&mut stream, &DecodeContext::default(), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_malformed_token_is_not_retried() {
        let transport =
            MemoryTransport::with_reads([packet(PacketStatus::END_OF_MESSAGE, &[0x01, 0, 0])]);
        let mut stream = TdsStream::new(Box::new(transport));
        let mut reader = TokenReader::default();

        let err = reader
            .next_token(&mut stream, &DecodeContext::default(), true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Protocol(ProtocolError::InvalidTokenType(0x01))
        ));
    }
}
