//! Dual-mode byte transports.
//!
//! Every protocol operation takes an `is_async` flag instead of having a
//! sync and an async twin. A [`Transport`] honors the flag: with
//! `is_async == false` it performs blocking I/O on the calling thread and the
//! returned future is already complete when first polled; with
//! `is_async == true` it suspends on the runtime's I/O driver.
//!
//! Callers running in sync mode resolve the future with a single poll, so a
//! sync-mode implementation must never return `Pending`.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// A boxed transport, the unit the connection pipeline passes around.
pub type BoxTransport = Box<dyn Transport>;

/// A bidirectional byte stream usable in blocking and non-blocking mode.
#[async_trait]
pub trait Transport: Send + Debug {
    /// Read into `buf`, returning the number of bytes read. Zero means EOF.
    async fn read(&mut self, buf: &mut [u8], is_async: bool) -> io::Result<usize>;

    /// Write all of `buf`.
    async fn write_all(&mut self, buf: &[u8], is_async: bool) -> io::Result<()>;

    /// Flush buffered writes.
    async fn flush(&mut self, is_async: bool) -> io::Result<()>;

    /// Remove one layer of wrapping, returning the transport underneath.
    ///
    /// Used to drop TLS after a login-only encrypted handshake. Transports
    /// that wrap nothing return `None`.
    fn into_inner(self: Box<Self>) -> Option<BoxTransport> {
        None
    }
}

#[derive(Debug, Default)]
struct Script {
    reads: VecDeque<Bytes>,
    written: BytesMut,
    sync_calls: usize,
    async_calls: usize,
}

/// In-memory transport serving scripted reads and capturing writes.
///
/// Each queued chunk is handed out by at most one `read` call, so chunk
/// boundaries model TCP segment boundaries. When the script runs dry,
/// reads report EOF. Clones share the same script, which lets a test keep a
/// handle after boxing the transport into a pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    script: Arc<Mutex<Script>>,
}

impl MemoryTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that will serve `chunks` in order.
    #[must_use]
    pub fn with_reads<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let transport = Self::new();
        for chunk in chunks {
            transport.push_read(chunk);
        }
        transport
    }

    /// Queue a chunk to be read.
    pub fn push_read(&self, chunk: impl Into<Bytes>) {
        self.script.lock().reads.push_back(chunk.into());
    }

    /// Everything written so far.
    #[must_use]
    pub fn written(&self) -> Bytes {
        self.script.lock().written.clone().freeze()
    }

    /// Take and clear everything written so far.
    pub fn take_written(&self) -> Bytes {
        self.script.lock().written.split().freeze()
    }

    /// Bytes still queued for reading.
    #[must_use]
    pub fn unread(&self) -> usize {
        self.script.lock().reads.iter().map(Bytes::len).sum()
    }

    /// Number of I/O calls made in (sync, async) mode.
    #[must_use]
    pub fn call_counts(&self) -> (usize, usize) {
        let script = self.script.lock();
        (script.sync_calls, script.async_calls)
    }

    fn record(script: &mut Script, is_async: bool) {
        if is_async {
            script.async_calls += 1;
        } else {
            script.sync_calls += 1;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read(&mut self, buf: &mut [u8], is_async: bool) -> io::Result<usize> {
        let mut script = self.script.lock();
        Self::record(&mut script, is_async);
        let Some(front) = script.reads.front_mut() else {
            return Ok(0);
        };
        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front.split_to(n));
        if front.is_empty() {
            script.reads.pop_front();
        }
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8], is_async: bool) -> io::Result<()> {
        let mut script = self.script.lock();
        Self::record(&mut script, is_async);
        script.written.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self, is_async: bool) -> io::Result<()> {
        Self::record(&mut self.script.lock(), is_async);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_respect_chunk_boundaries() {
        let mut transport = MemoryTransport::with_reads([&b"abc"[..], &b"de"[..]]);
        let mut buf = [0u8; 8];

        assert_eq!(transport.read(&mut buf, true).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(transport.read(&mut buf[..1], false).await.unwrap(), 1);
        assert_eq!(transport.read(&mut buf, true).await.unwrap(), 1);
        assert_eq!(buf[0], b'e');
        assert_eq!(transport.read(&mut buf, true).await.unwrap(), 0);
        assert_eq!(transport.call_counts(), (1, 3));
    }

    #[tokio::test]
    async fn test_clone_observes_writes() {
        let handle = MemoryTransport::new();
        let mut boxed: BoxTransport = Box::new(handle.clone());
        boxed.write_all(b"hello", false).await.unwrap();
        boxed.flush(false).await.unwrap();

        assert_eq!(&handle.take_written()[..], b"hello");
        assert!(handle.written().is_empty());
        assert!(boxed.into_inner().is_none());
    }
}
