//! Concurrency limiter backed by a counting semaphore.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, Either};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use super::{Admission, RateLimiter};
use crate::error::{Error, Result};

/// Caps the number of units of work running at once.
///
/// A waiting caller suspends in async mode and blocks its thread in sync
/// mode. Cancellation ends the wait; the permit is released when the
/// admission completes or is dropped.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyLimiter {
    /// Allow at most `max` concurrent units of work.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Configured maximum.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn admission(permit: OwnedSemaphorePermit) -> Admission {
        Admission::new(move |_| drop(permit))
    }

    async fn wait_async(&self, ct: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = ct.cancelled() => Err(Error::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| closed())
            }
        }
    }

    fn wait_blocking(&self, ct: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        let acquire = Box::pin(Arc::clone(&self.semaphore).acquire_owned());
        let cancelled = Box::pin(ct.cancelled());
        match futures::executor::block_on(future::select(cancelled, acquire)) {
            Either::Left(_) => Err(Error::Cancelled),
            Either::Right((permit, _)) => permit.map_err(|_| closed()),
        }
    }
}

fn closed() -> Error {
    Error::Config("concurrency limiter is closed".into())
}

#[async_trait]
impl RateLimiter for ConcurrencyLimiter {
    async fn admit(&self, is_async: bool, ct: &CancellationToken) -> Result<Admission> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(Self::admission(permit)),
            Err(TryAcquireError::Closed) => return Err(closed()),
            Err(TryAcquireError::NoPermits) => {}
        }

        tracing::debug!(max = self.max, "waiting for concurrency permit");
        let permit = if is_async {
            self.wait_async(ct).await?
        } else {
            self.wait_blocking(ct)?
        };
        Ok(Self::admission(permit))
    }
}
