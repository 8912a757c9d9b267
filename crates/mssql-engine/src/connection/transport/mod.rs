//! Transport creation handlers.
//!
//! A [`TransportChain`] asks each [`TransportHandler`] in order to open the
//! data source's resolved protocol. A handler that does not serve the
//! protocol returns `Ok(None)` and the next one is asked; exactly one
//! handler attempts a connection. If none applies the chain fails with
//! [`TransportError::NoHandler`].

pub mod named_pipe;
pub mod shared_memory;
pub mod socket;
pub mod tcp;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use mssql_codec::BoxTransport;
use tokio_util::sync::CancellationToken;

use super::ConnectionHandler;
use super::context::ConnectionHandlerContext;
use crate::config::ConnectionOptions;
use crate::datasource::DataSource;
use crate::error::{Result, TransportError};

pub use named_pipe::NamedPipeHandler;
pub use shared_memory::SharedMemoryHandler;
pub use socket::{DualModeSocket, SocketTransport};
pub use tcp::TcpHandler;

/// Opens a transport for the protocols it serves.
#[async_trait]
pub trait TransportHandler: Send + Sync + Debug {
    /// Open a transport, or return `None` if the resolved protocol is not
    /// served by this handler.
    async fn open(
        &self,
        data_source: &DataSource,
        options: &ConnectionOptions,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Option<BoxTransport>>;
}

/// Ordered transport handlers.
#[derive(Debug, Clone)]
pub struct TransportChain {
    handlers: Vec<Arc<dyn TransportHandler>>,
}

impl Default for TransportChain {
    fn default() -> Self {
        Self::new()
            .with(TcpHandler)
            .with(NamedPipeHandler::default())
            .with(SharedMemoryHandler::default())
    }
}

impl TransportChain {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler.
    #[must_use]
    pub fn with(mut self, handler: impl TransportHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Open a transport with the first handler serving the protocol.
    pub async fn open(
        &self,
        data_source: &DataSource,
        options: &ConnectionOptions,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<BoxTransport> {
        for handler in &self.handlers {
            if let Some(transport) = handler.open(data_source, options, is_async, ct).await? {
                return Ok(transport);
            }
        }
        Err(TransportError::NoHandler(data_source.resolved_protocol).into())
    }
}

#[async_trait]
impl ConnectionHandler for TransportChain {
    async fn handle(
        &self,
        ctx: &mut ConnectionHandlerContext,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        let transport = self
            .open(ctx.data_source()?, &ctx.options, is_async, ct)
            .await?;
        ctx.transport = Some(transport);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::datasource::Protocol;
    use crate::error::Error;
    use mssql_codec::MemoryTransport;

    #[derive(Debug)]
    struct Serves(Protocol);

    #[async_trait]
    impl TransportHandler for Serves {
        async fn open(
            &self,
            data_source: &DataSource,
            _options: &ConnectionOptions,
            _is_async: bool,
            _ct: &CancellationToken,
        ) -> Result<Option<BoxTransport>> {
            if data_source.resolved_protocol != self.0 {
                return Ok(None);
            }
            Ok(Some(Box::new(MemoryTransport::new())))
        }
    }

    #[tokio::test]
    async fn test_delegates_to_matching_handler() {
        let chain = TransportChain::new()
            .with(Serves(Protocol::NamedPipe))
            .with(Serves(Protocol::Tcp));
        let ds = DataSource::parse("tcp:server,1433").unwrap();
        let options = ConnectionOptions::new("tcp:server,1433");
        let ct = CancellationToken::new();
        assert!(chain.open(&ds, &options, true, &ct).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_handler_is_surfaced() {
        let chain = TransportChain::new().with(Serves(Protocol::NamedPipe));
        let ds = DataSource::parse("server").unwrap();
        let options = ConnectionOptions::new("server");
        let err = chain
            .open(&ds, &options, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::NoHandler(Protocol::Tcp))
        ));
    }
}
