//! Running dual-mode operations from blocking code.
//!
//! Every engine operation is an `async fn` taking `is_async`. With
//! `is_async == false` the transports block on the calling thread, so the
//! returned future completes on its first poll and can be resolved without a
//! runtime.

use std::future::Future;

use futures::FutureExt;

use crate::error::{Error, Result};

/// Resolve a sync-mode future with a single poll.
///
/// Returns [`Error::SyncSuspended`] if the future is not ready, which means
/// something below it waited on an async resource despite `is_async == false`.
pub fn block_on_sync<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    fut.now_or_never().unwrap_or_else(|| {
        tracing::error!("sync-mode operation suspended");
        Err(Error::SyncSuspended)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_future_resolves() {
        let value = block_on_sync(async { Ok::<_, Error>(42) }).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_pending_future_is_reported() {
        let err = block_on_sync(futures::future::pending::<Result<()>>()).unwrap_err();
        assert!(matches!(err, Error::SyncSuspended));
    }
}
