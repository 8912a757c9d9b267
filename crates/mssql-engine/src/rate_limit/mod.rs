//! Rate limiters wrapping units of work.
//!
//! A [`RateLimiterChain`] is an ordered list of [`RateLimiter`]s. Before the
//! work runs, each limiter in order grants an [`Admission`]; afterwards the
//! admissions are completed in reverse order with the work's [`Outcome`].
//! The work's result, success or error, is returned unchanged.
//!
//! ```rust,ignore
//! let chain = RateLimiterChain::new()
//!     .with(ConcurrencyLimiter::new(32))
//!     .with(BlockingPeriodLimiter::new());
//! let ctx = chain.execute(is_async, &ct, || pipeline.connect(&options, is_async, &ct)).await?;
//! ```

pub mod blocking;
pub mod concurrency;

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use blocking::BlockingPeriodLimiter;
pub use concurrency::ConcurrencyLimiter;

/// How an admitted unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The work returned `Ok`.
    Succeeded,
    /// The work returned an error other than cancellation.
    Failed,
    /// The work was cancelled or never ran.
    Abandoned,
}

impl Outcome {
    /// Classify a result.
    #[must_use]
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(Error::Cancelled) => Self::Abandoned,
            Err(_) => Self::Failed,
        }
    }
}

type Release = Box<dyn FnOnce(Outcome) + Send>;

/// Permission to run one unit of work.
///
/// Dropping an admission without completing it reports
/// [`Outcome::Abandoned`], so resources held by the limiter are always
/// released.
#[must_use = "dropping an admission abandons it"]
pub struct Admission {
    release: Option<Release>,
}

impl Admission {
    /// An admission that runs `release` with the outcome.
    pub fn new(release: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// An admission with nothing to release.
    pub fn unconditional() -> Self {
        Self { release: None }
    }

    /// Report the outcome and release.
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(release) = self.release.take() {
            release(outcome);
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(Outcome::Abandoned);
        }
    }
}

impl Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

/// A policy deciding whether a unit of work may run.
#[async_trait]
pub trait RateLimiter: Send + Sync + Debug {
    /// Wait for (or refuse) admission.
    ///
    /// Waiting honors `ct` and `is_async`: in sync mode the calling thread
    /// blocks.
    async fn admit(&self, is_async: bool, ct: &CancellationToken) -> Result<Admission>;
}

/// A limiter that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughLimiter;

#[async_trait]
impl RateLimiter for PassthroughLimiter {
    async fn admit(&self, _is_async: bool, ct: &CancellationToken) -> Result<Admission> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Admission::unconditional())
    }
}

/// Limiters applied in order around a unit of work.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterChain {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl RateLimiterChain {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a limiter.
    #[must_use]
    pub fn with(mut self, limiter: impl RateLimiter + 'static) -> Self {
        self.limiters.push(Arc::new(limiter));
        self
    }

    /// Append a limiter shared with other chains.
    #[must_use]
    pub fn with_shared(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    /// Number of limiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether the chain has no limiters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Run `work` once every limiter has admitted it.
    pub async fn execute<T, F, Fut>(
        &self,
        is_async: bool,
        ct: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut admissions = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            // Earlier admissions are dropped, and so released, on refusal.
            admissions.push(limiter.admit(is_async, ct).await?);
        }

        let result = work().await;
        let outcome = Outcome::of(&result);
        for admission in admissions.into_iter().rev() {
            admission.complete(outcome);
        }
        result
    }
}
