//! Backoff strategies for throttled admissions.
//!
//! A backoff stretches a base wait (the time until the next token, or a server's retry hint)
//! according to how many times the same operation has already been throttled. Attempt semantics:
//! attempt `0` is the first retry and waits exactly `wait`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use fetchgate::BackoffStrategy;
//!
//! let wait = Duration::from_millis(500);
//! assert_eq!(BackoffStrategy::Exponential.delay(wait, 0), Duration::from_millis(500));
//! assert_eq!(BackoffStrategy::Exponential.delay(wait, 2), Duration::from_millis(2000));
//! assert_eq!(BackoffStrategy::Linear.delay(wait, 2), Duration::from_millis(1500));
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// How the delay grows between successive retries of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `wait * (attempt + 1)`
    Linear,
    /// `wait * 2^attempt`
    #[default]
    Exponential,
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0-based) given the base `wait`.
    pub fn delay(&self, wait: Duration, attempt: u32) -> Duration {
        let scaled = match self {
            BackoffStrategy::Linear => {
                let factor = u128::from(attempt) + 1;
                wait.as_nanos().saturating_mul(factor)
            }
            BackoffStrategy::Exponential => {
                let factor = 2u128.saturating_pow(attempt);
                wait.as_nanos().saturating_mul(factor)
            }
        };
        let capped = scaled.min(MAX_BACKOFF.as_nanos());
        Duration::from_nanos(capped as u64)
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}
