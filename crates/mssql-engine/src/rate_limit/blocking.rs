//! Blocking-period limiter.
//!
//! After a failure the limiter refuses work for a blocking period. When the
//! period ends, exactly one trial call is admitted: success clears the
//! block, failure starts a longer period. Periods start at
//! [`DEFAULT_BASE_PERIOD`] and double up to [`DEFAULT_MAX_PERIOD`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Admission, Outcome, RateLimiter};
use crate::error::{Error, Result};

/// First blocking period after a failure.
pub const DEFAULT_BASE_PERIOD: Duration = Duration::from_secs(5);

/// Longest blocking period.
pub const DEFAULT_MAX_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BlockState {
    blocked_until: Option<Instant>,
    period: Duration,
    trial_in_flight: bool,
}

/// Refuses work for a growing period after failures.
#[derive(Debug, Clone)]
pub struct BlockingPeriodLimiter {
    state: Arc<Mutex<BlockState>>,
    base: Duration,
    max: Duration,
}

impl Default for BlockingPeriodLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingPeriodLimiter {
    /// A limiter with the default periods.
    #[must_use]
    pub fn new() -> Self {
        Self::with_periods(DEFAULT_BASE_PERIOD, DEFAULT_MAX_PERIOD)
    }

    /// A limiter with custom first and longest periods.
    #[must_use]
    pub fn with_periods(base: Duration, max: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BlockState {
                blocked_until: None,
                period: base,
                trial_in_flight: false,
            })),
            base,
            max: max.max(base),
        }
    }

    /// Whether work is currently refused.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        let state = self.state.lock();
        state.trial_in_flight || state.blocked_until.is_some_and(|until| Instant::now() < until)
    }

    fn on_normal(state: &Mutex<BlockState>, base: Duration, outcome: Outcome) {
        if outcome != Outcome::Failed {
            return;
        }
        let mut state = state.lock();
        // A block already started by a concurrent failure is not extended.
        if state.blocked_until.is_none() {
            state.period = base;
            state.blocked_until = Some(Instant::now() + base);
            tracing::warn!(period = ?base, "entering blocking period");
        }
    }

    fn on_trial(state: &Mutex<BlockState>, base: Duration, max: Duration, outcome: Outcome) {
        let mut state = state.lock();
        state.trial_in_flight = false;
        match outcome {
            Outcome::Succeeded => {
                state.blocked_until = None;
                state.period = base;
                tracing::info!("blocking period cleared");
            }
            Outcome::Failed => {
                let period = state.period.saturating_mul(2).min(max);
                state.period = period;
                state.blocked_until = Some(Instant::now() + period);
                tracing::warn!(?period, "trial failed, extending blocking period");
            }
            // The next caller becomes the trial.
            Outcome::Abandoned => {}
        }
    }
}

#[async_trait]
impl RateLimiter for BlockingPeriodLimiter {
    async fn admit(&self, _is_async: bool, ct: &CancellationToken) -> Result<Admission> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut state = self.state.lock();
        let shared = Arc::clone(&self.state);
        let base = self.base;
        match state.blocked_until {
            None => Ok(Admission::new(move |outcome| {
                Self::on_normal(&shared, base, outcome);
            })),
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    return Err(Error::Blocked {
                        retry_after: until - now,
                    });
                }
                if state.trial_in_flight {
                    // Retry as soon as the trial resolves.
                    return Err(Error::Blocked {
                        retry_after: Duration::ZERO,
                    });
                }
                state.trial_in_flight = true;
                let max = self.max;
                tracing::debug!("admitting trial call after blocking period");
                Ok(Admission::new(move |outcome| {
                    Self::on_trial(&shared, base, max, outcome);
                }))
            }
        }
    }
}
