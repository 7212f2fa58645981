//! Retry fallible operations with deterministic exponential backoff.
//!
//! An operation reports each failure as either [Error::Transient] (eligible for another attempt)
//! or [Error::Permanent] (retrying cannot change the outcome). Transient failures are retried
//! after a delay that grows geometrically from [Policy::min_delay] by [Policy::multiplier]. No
//! jitter is applied, so the schedule of attempts is fully determined by the [Policy] (which makes
//! it reproducible under a deterministic [Clock]).
//!
//! ```txt
//! Attempting --ok--------------------> Done
//!     |  \---permanent---------------> Done (inner error)
//!     |   \--transient, exhausted----> Done (last error)
//!     transient
//!     v
//!  Waiting (min_delay * multiplier^(n-2)) --> Attempting
//! ```
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use std::time::Duration;
//! use tally_retry::{retry, Error, Policy};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let policy = Policy {
//!         min_delay: Duration::from_millis(10),
//!         ..Default::default()
//!     };
//!     let mut remaining = 2;
//!     let result = retry(&context, &policy, || {
//!         remaining -= 1;
//!         let failed = remaining > 0;
//!         async move {
//!             if failed {
//!                 return Err(Error::Transient("unavailable"));
//!             }
//!             Ok(42)
//!         }
//!     })
//!     .await;
//!     assert_eq!(result, Ok(42));
//! });
//! ```

use commonware_runtime::Clock;
use std::{fmt::Display, future::Future, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Failure reported by an operation passed to [retry].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The operation may succeed if attempted again.
    #[error("transient: {0}")]
    Transient(E),
    /// The operation cannot succeed. Retrying stops immediately.
    #[error("permanent: {0}")]
    Permanent(E),
}

impl<E> Error<E> {
    /// Returns true if retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }

    /// Returns the wrapped error.
    pub fn into_inner(self) -> E {
        match self {
            Error::Transient(err) | Error::Permanent(err) => err,
        }
    }
}

/// Backoff schedule applied by [retry].
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    /// Delay before the second attempt.
    pub min_delay: Duration,

    /// Factor applied to the delay after each failed retry.
    pub multiplier: f64,

    /// Number of retries after the first attempt (the operation runs at most
    /// `max_retries + 1` times). Zero retries forever.
    pub max_retries: u64,

    /// Upper bound on any single delay.
    pub max_delay: Option<Duration>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_retries: 3,
            max_delay: None,
        }
    }
}

impl Policy {
    /// Returns the delay to wait before the `retry`-th retry (1-indexed).
    ///
    /// The `n`-th attempt (with `n >= 2`) is preceded by `min_delay * multiplier^(n-2)`, so
    /// `retry` (which equals `n - 1`) maps to an exponent of `retry - 1`.
    pub fn delay(&self, retry: u64) -> Duration {
        if self.min_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(i32::MAX as u64) as i32;
        let seconds = self.min_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Returns true if no further retries are permitted after `retries` retries.
    pub fn exhausted(&self, retries: u64) -> bool {
        self.max_retries != 0 && retries >= self.max_retries
    }
}

/// Runs `operation` until it succeeds, fails permanently, or exhausts `policy`.
///
/// A permanent failure is returned unwrapped as soon as it is observed, regardless of how many
/// retries remain. When retries are exhausted, the last transient failure is returned.
///
/// Operations that produce no value simply return `Ok(())`.
pub async fn retry<C, T, E, F, Fut>(clock: &C, policy: &Policy, mut operation: F) -> Result<T, E>
where
    C: Clock,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error<E>>>,
{
    let mut retries = 0u64;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(Error::Permanent(err)) => {
                debug!(retries, %err, "permanent failure");
                return Err(err);
            }
            Err(Error::Transient(err)) => err,
        };
        if policy.exhausted(retries) {
            warn!(retries, %err, "retries exhausted");
            return Err(err);
        }
        retries += 1;
        let delay = policy.delay(retries);
        debug!(retries, ?delay, %err, "transient failure");
        clock.sleep(delay).await;
    }
}
