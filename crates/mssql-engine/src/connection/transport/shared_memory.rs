//! Shared memory transport handler.
//!
//! Shared memory is served as the local server's named pipe: the default
//! pipe, or the instance pipe when an instance is named.

use async_trait::async_trait;
use mssql_codec::BoxTransport;
use tokio_util::sync::CancellationToken;

use super::TransportHandler;
use super::named_pipe::NamedPipeHandler;
use crate::config::ConnectionOptions;
use crate::datasource::{DEFAULT_PIPE_NAME, DataSource, Protocol};
use crate::error::{Error, Result};

/// Opens shared memory (`lpc:`) connections.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryHandler {
    pipes: NamedPipeHandler,
}

impl SharedMemoryHandler {
    /// Use `pipes` to reach the local server.
    #[must_use]
    pub fn new(pipes: NamedPipeHandler) -> Self {
        Self { pipes }
    }

    /// Local pipe serving `data_source`.
    #[must_use]
    pub fn local_pipe_name(data_source: &DataSource) -> String {
        match &data_source.instance_name {
            Some(instance) => format!(r"MSSQL${instance}\{DEFAULT_PIPE_NAME}"),
            None => DEFAULT_PIPE_NAME.to_string(),
        }
    }
}

#[async_trait]
impl TransportHandler for SharedMemoryHandler {
    async fn open(
        &self,
        data_source: &DataSource,
        _options: &ConnectionOptions,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<Option<BoxTransport>> {
        if data_source.resolved_protocol != Protocol::SharedMemory {
            return Ok(None);
        }
        if data_source.server_name != "localhost" {
            return Err(Error::Config(format!(
                "shared memory only reaches the local server, not '{}'",
                data_source.server_name
            )));
        }
        let pipe_name = Self::local_pipe_name(data_source);
        tracing::debug!(pipe = %pipe_name, "serving shared memory through the local pipe");
        self.pipes
            .open_pipe(".", &pipe_name, is_async, ct)
            .await
            .map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_local_pipe_name() {
        let ds = DataSource::parse("lpc:.").unwrap();
        assert_eq!(SharedMemoryHandler::local_pipe_name(&ds), DEFAULT_PIPE_NAME);

        let mut ds = ds;
        ds.instance_name = Some("inst".into());
        assert_eq!(
            SharedMemoryHandler::local_pipe_name(&ds),
            r"MSSQL$inst\sql\query"
        );
    }

    #[tokio::test]
    async fn test_remote_server_rejected() {
        let ds = DataSource::parse("lpc:otherhost").unwrap();
        let options = ConnectionOptions::new("lpc:otherhost");
        let err = SharedMemoryHandler::default()
            .open(&ds, &options, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
