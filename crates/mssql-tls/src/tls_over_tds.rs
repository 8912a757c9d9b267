//! TLS handshake tunneled through TDS pre-login packets.
//!
//! In TDS 7.x the TLS handshake records travel inside PRELOGIN (0x12)
//! packets. [`TlsOverTds`] sits between the TLS engine and the raw transport:
//! while framing is on it wraps each flushed write in PRELOGIN packets and
//! strips packet headers from reads. Once the handshake completes the owner
//! turns framing off through the [`FramingSwitch`] and the wrapper becomes a
//! pass-through, since TLS records then travel bare on the wire.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mssql_codec::{BoxTransport, Transport};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
};

/// Handle that turns PRELOGIN framing off after the handshake.
#[derive(Debug, Clone)]
pub struct FramingSwitch {
    framing: Arc<AtomicBool>,
}

impl FramingSwitch {
    /// Stop framing; subsequent traffic passes through unchanged.
    pub fn disable(&self) {
        self.framing.store(false, Ordering::Release);
        tracing::trace!("TLS-over-TDS framing disabled");
    }

    /// Whether framing is still on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.framing.load(Ordering::Acquire)
    }
}

/// Transport that frames TLS handshake traffic in PRELOGIN packets.
#[derive(Debug)]
pub struct TlsOverTds {
    inner: BoxTransport,
    framing: Arc<AtomicBool>,
    header: [u8; PACKET_HEADER_SIZE],
    header_pos: usize,
    read_remaining: usize,
    write_buf: Vec<u8>,
}

impl TlsOverTds {
    /// Wrap `inner` with framing on.
    #[must_use]
    pub fn new(inner: BoxTransport) -> (Self, FramingSwitch) {
        let framing = Arc::new(AtomicBool::new(true));
        let wrapper = Self {
            inner,
            framing: Arc::clone(&framing),
            header: [0u8; PACKET_HEADER_SIZE],
            header_pos: 0,
            read_remaining: 0,
            write_buf: Vec::new(),
        };
        (wrapper, FramingSwitch { framing })
    }

    fn framing(&self) -> bool {
        self.framing.load(Ordering::Acquire)
    }

    /// Frame the buffered handshake bytes into PRELOGIN packets.
    fn frame_pending(&mut self) -> Vec<u8> {
        let max_payload = DEFAULT_PACKET_SIZE - PACKET_HEADER_SIZE;
        let mut out = Vec::with_capacity(self.write_buf.len() + PACKET_HEADER_SIZE);
        let mut chunks = self.write_buf.chunks(max_payload).peekable();
        let mut packet_id: u8 = 1;

        while let Some(chunk) = chunks.next() {
            let status = if chunks.peek().is_none() {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            let length = (PACKET_HEADER_SIZE + chunk.len()) as u16;
            PacketHeader::new(PacketType::PreLogin, status, length)
                .with_packet_id(packet_id)
                .encode(&mut out);
            out.extend_from_slice(chunk);
            packet_id = packet_id.wrapping_add(1);
        }

        tracing::trace!(bytes = self.write_buf.len(), "framed TLS handshake data");
        self.write_buf.clear();
        out
    }
}

#[async_trait]
impl Transport for TlsOverTds {
    async fn read(&mut self, buf: &mut [u8], is_async: bool) -> io::Result<usize> {
        if !self.framing() {
            return self.inner.read(buf, is_async).await;
        }

        while self.read_remaining == 0 {
            while self.header_pos < PACKET_HEADER_SIZE {
                let n = self
                    .inner
                    .read(&mut self.header[self.header_pos..], is_async)
                    .await?;
                if n == 0 {
                    return Ok(0);
                }
                self.header_pos += n;
            }
            self.header_pos = 0;

            if self.header[0] != PacketType::PreLogin as u8 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "expected PRELOGIN packet during TLS handshake, got 0x{:02X}",
                        self.header[0]
                    ),
                ));
            }
            let length = u16::from_be_bytes([self.header[2], self.header[3]]) as usize;
            self.read_remaining = length.saturating_sub(PACKET_HEADER_SIZE);
            tracing::trace!(payload = self.read_remaining, "unwrapping TLS handshake packet");
        }

        let max = self.read_remaining.min(buf.len());
        let n = self.inner.read(&mut buf[..max], is_async).await?;
        self.read_remaining -= n;
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8], is_async: bool) -> io::Result<()> {
        if !self.framing() {
            return self.inner.write_all(buf, is_async).await;
        }
        self.write_buf.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self, is_async: bool) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            let framed = self.frame_pending();
            self.inner.write_all(&framed, is_async).await?;
        }
        self.inner.flush(is_async).await
    }

    fn into_inner(self: Box<Self>) -> Option<BoxTransport> {
        Some(self.inner)
    }
}
