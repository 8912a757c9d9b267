//! Connection establishment pipeline.
//!
//! ```text
//! DataSourceHandler → TransportChain (TCP / named pipe / shared memory)
//!                   → PreloginHandler (TDS 7.4 or TDS 8.0 TLS) → LoginHandler
//! ```
//!
//! Every stage implements [`ConnectionHandler`]. Stages are stateless and
//! the pipeline is built once and reused; all per-attempt state lives in the
//! [`ConnectionHandlerContext`]. A failing stage's error is stored on the
//! context and the remaining stages are skipped.

pub mod context;
pub mod login;
pub mod prelogin;
pub mod transport;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionOptions;
use crate::datasource::DataSource;
use crate::error::{Error, Result};
use crate::parser::TdsContext;

pub use context::{ConnectionHandlerContext, NegotiatedEncryption, ServerInfo};
pub use login::LoginHandler;
pub use prelogin::{PreloginHandler, PreloginHandlerContext, negotiate_encryption};
pub use transport::{TransportChain, TransportHandler};

/// One stage of the connection pipeline.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + Debug {
    /// Run the stage against `ctx`.
    async fn handle(
        &self,
        ctx: &mut ConnectionHandlerContext,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()>;
}

/// Parses the data source string.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataSourceHandler;

#[async_trait]
impl ConnectionHandler for DataSourceHandler {
    async fn handle(
        &self,
        ctx: &mut ConnectionHandlerContext,
        _is_async: bool,
        ct: &CancellationToken,
    ) -> Result<()> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let data_source = DataSource::parse(&ctx.options.data_source)?;
        tracing::debug!(
            protocol = ?data_source.resolved_protocol,
            server = %data_source.server_name,
            "data source resolved"
        );
        ctx.data_source = Some(data_source);
        Ok(())
    }
}

/// Ordered connection stages.
#[derive(Debug, Clone)]
pub struct ConnectionPipeline {
    stages: Vec<Arc<dyn ConnectionHandler>>,
}

impl Default for ConnectionPipeline {
    fn default() -> Self {
        Self::new()
            .with(DataSourceHandler)
            .with(TransportChain::default())
            .with(PreloginHandler)
            .with(LoginHandler)
    }
}

impl ConnectionPipeline {
    /// An empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage.
    #[must_use]
    pub fn with(mut self, stage: impl ConnectionHandler + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the stages in order, stopping at the first failure.
    ///
    /// The failure is left in [`ConnectionHandlerContext::error`].
    pub async fn handle(
        &self,
        ctx: &mut ConnectionHandlerContext,
        is_async: bool,
        ct: &CancellationToken,
    ) {
        for stage in &self.stages {
            if ctx.has_error() {
                return;
            }
            if let Err(e) = stage.handle(ctx, is_async, ct).await {
                tracing::debug!(stage = ?stage, error = %e, "connection stage failed");
                ctx.error = Some(e);
            }
        }
    }

    /// Open and log in a session.
    pub async fn connect(
        &self,
        options: ConnectionOptions,
        is_async: bool,
        ct: &CancellationToken,
    ) -> Result<TdsContext> {
        options.validate()?;
        let mut ctx = ConnectionHandlerContext::new(options);
        self.handle(&mut ctx, is_async, ct).await;
        if let Some(e) = ctx.error.take() {
            return Err(e);
        }
        ctx.session
            .take()
            .ok_or_else(|| Error::Config("connection pipeline produced no session".into()))
    }
}

/// Open and log in a session with the default pipeline.
pub async fn connect(
    options: ConnectionOptions,
    is_async: bool,
    ct: &CancellationToken,
) -> Result<TdsContext> {
    ConnectionPipeline::default().connect(options, is_async, ct).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Step {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl ConnectionHandler for Step {
        async fn handle(
            &self,
            _ctx: &mut ConnectionHandlerContext,
            _is_async: bool,
            _ct: &CancellationToken,
        ) -> Result<()> {
            self.log.lock().push(self.name);
            if self.fail {
                return Err(Error::Config(self.name.into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = |name, fail| Step {
            name,
            log: Arc::clone(&log),
            fail,
        };
        let pipeline = ConnectionPipeline::new()
            .with(step("first", false))
            .with(step("second", true))
            .with(step("third", false));

        let mut ctx = ConnectionHandlerContext::new(ConnectionOptions::new("server"));
        pipeline.handle(&mut ctx, true, &CancellationToken::new()).await;

        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert!(matches!(ctx.error, Some(Error::Config(ref m)) if m == "second"));
    }

    #[tokio::test]
    async fn test_data_source_stage() {
        let mut ctx = ConnectionHandlerContext::new(ConnectionOptions::new("tcp:db,1500"));
        DataSourceHandler
            .handle(&mut ctx, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ctx.data_source().unwrap().port, Some(1500));

        let mut ctx = ConnectionHandlerContext::new(ConnectionOptions::new("db,"));
        let pipeline = ConnectionPipeline::default();
        pipeline.handle(&mut ctx, true, &CancellationToken::new()).await;
        assert!(matches!(ctx.error, Some(Error::Config(_))));
        assert!(ctx.transport.is_none());
    }

    #[tokio::test]
    async fn test_connect_validates_options() {
        let err = connect(ConnectionOptions::new("server"), true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
