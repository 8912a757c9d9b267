//! Packet-aware buffered stream over a [`Transport`].
//!
//! [`TdsStream`] turns whole messages into packets on the way out and hands
//! back packet payloads on the way in, tracking where the current response
//! message ends. It is exclusively owned by one session.

use std::future::Future;
use std::io;

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType,
};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use crate::error::{CodecError, Result};
use crate::packet_codec::{Packet, TdsCodec};
use crate::transport::BoxTransport;

const READ_CHUNK: usize = 8192;
const MIN_PACKET_SIZE: usize = 512;

/// Run one transport call under the session's cancellation token.
///
/// In sync mode the transport call blocks and completes on its first poll,
/// so cancellation is only checked before it starts.
pub async fn cancellable<T, F>(fut: F, is_async: bool, ct: &CancellationToken) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if ct.is_cancelled() {
        return Err(CodecError::Cancelled);
    }
    if !is_async {
        return fut.await.map_err(CodecError::Io);
    }
    tokio::select! {
        biased;
        () = ct.cancelled() => Err(CodecError::Cancelled),
        result = fut => result.map_err(CodecError::Io),
    }
}

/// Buffered TDS packet stream.
#[derive(Debug)]
pub struct TdsStream {
    transport: BoxTransport,
    codec: TdsCodec,
    read_buf: BytesMut,
    packet_size: usize,
    message_complete: bool,
    spid: u16,
}

impl TdsStream {
    /// Create a stream with the default packet size.
    #[must_use]
    pub fn new(transport: BoxTransport) -> Self {
        Self {
            transport,
            codec: TdsCodec::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            packet_size: DEFAULT_PACKET_SIZE,
            message_complete: false,
            spid: 0,
        }
    }

    /// Set the outgoing packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.set_packet_size(packet_size);
        self
    }

    /// Outgoing packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Change the outgoing packet size, clamped to the protocol limits.
    pub fn set_packet_size(&mut self, packet_size: usize) {
        self.packet_size = packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        tracing::debug!(packet_size = self.packet_size, "packet size changed");
    }

    /// Server process id taken from the last packet read.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.spid
    }

    /// Whether the current response message has packets left to read.
    #[must_use]
    pub fn has_pending_data(&self) -> bool {
        !self.message_complete
    }

    /// Expect a new response message from the server.
    pub fn begin_response(&mut self) {
        self.message_complete = false;
    }

    /// Give up the stream, returning its transport.
    #[must_use]
    pub fn into_transport(self) -> BoxTransport {
        if !self.read_buf.is_empty() {
            tracing::warn!(
                buffered = self.read_buf.len(),
                "dropping unread bytes while releasing transport"
            );
        }
        self.transport
    }

    /// Write `payload` as one message split into packets, then flush.
    pub async fn write_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        let max_payload = self.packet_size - PACKET_HEADER_SIZE;
        let mut out = BytesMut::with_capacity(payload.len() + PACKET_HEADER_SIZE);
        self.codec.reset_packet_id();

        let mut chunks = payload.chunks(max_payload).peekable();
        if chunks.peek().is_none() {
            self.encode_packet(packet_type, PacketStatus::END_OF_MESSAGE, &[], &mut out)?;
        }
        while let Some(chunk) = chunks.next() {
            let status = if chunks.peek().is_none() {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            self.encode_packet(packet_type, status, chunk, &mut out)?;
        }

        self.send(&out, is_async, ct).await?;
        self.message_complete = false;
        tracing::debug!(
            packet_type = ?packet_type,
            payload_len = payload.len(),
            "flushed TDS message"
        );
        Ok(())
    }

    /// Send an attention signal.
    pub async fn send_attention(&mut self, is_async: bool, ct: &CancellationToken) -> Result<()> {
        let mut out = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.codec.reset_packet_id();
        self.encode_packet(
            PacketType::Attention,
            PacketStatus::END_OF_MESSAGE,
            &[],
            &mut out,
        )?;
        self.send(&out, is_async, ct).await?;
        self.message_complete = false;
        tracing::debug!("sent attention");
        Ok(())
    }

    /// Read the payload of the next packet in the current response.
    ///
    /// Returns `None` once the packet carrying end-of-message has been read.
    pub async fn read_payload(
        &mut self,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        if self.message_complete {
            return Ok(None);
        }
        let packet = self.read_packet(is_async, ct).await?;
        if packet.is_end_of_message() {
            self.message_complete = true;
        }
        Ok(Some(packet.payload.freeze()))
    }

    /// Read the rest of the current response as one buffer.
    pub async fn read_message(&mut self, is_async: bool, ct: &CancellationToken) -> Result<Bytes> {
        let mut message = BytesMut::new();
        while let Some(payload) = self.read_payload(is_async, ct).await? {
            message.extend_from_slice(&payload);
        }
        Ok(message.freeze())
    }

    async fn read_packet(&mut self, is_async: bool, ct: &CancellationToken) -> Result<Packet> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.read_buf)? {
                self.spid = packet.header.spid;
                return Ok(packet);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = cancellable(self.transport.read(&mut chunk, is_async), is_async, ct).await?;
            if n == 0 {
                return Err(CodecError::ConnectionClosed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn encode_packet(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<()> {
        let header = PacketHeader::new(packet_type, status, 0);
        self.codec
            .encode(Packet::new(header, BytesMut::from(payload)), out)
    }

    async fn send(&mut self, data: &[u8], is_async: bool, ct: &CancellationToken) -> Result<()> {
        cancellable(self.transport.write_all(data, is_async), is_async, ct).await?;
        cancellable(self.transport.flush(is_async), is_async, ct).await
    }
}
