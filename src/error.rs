//! Error types for the governance layer.
//!
//! Only actionable failures reach callers of [`crate::GovernanceLayer::issue`]: local rate limit
//! exhaustion, oversized payloads, exhausted server retries, queue eviction, cancellation, and
//! the wrapped transport's own failures. Durable cache failures stay internal.
use std::time::Duration;

/// Unified error returned to callers of the governance layer.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GovernanceError<E> {
    /// The local bucket stayed empty and the retry ceiling was reached.
    #[error("rate limit exceeded for '{category}' (next token in {retry_after:?})")]
    RateLimitExceeded { category: String, retry_after: Duration },
    /// The request body exceeds the configured size guard. Never retried.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    /// The transport kept reporting throttling until the retry ceiling was reached.
    #[error("server throttled '{category}' on all {attempts} attempts")]
    MaxRetriesExceeded { category: String, attempts: u32 },
    /// The operation was still waiting when the queue was cleared.
    #[error("operation evicted from the queue before it started")]
    QueueCleared,
    /// The caller cancelled before a result was produced.
    #[error("operation cancelled by caller")]
    Cancelled,
    /// The dispatched operation ended without reporting (panic or runtime shutdown).
    #[error("operation aborted before producing a result")]
    Aborted,
    /// Passthrough of the wrapped transport's failure.
    #[error("transport failure: {0}")]
    Transport(#[source] E),
}

impl<E> GovernanceError<E> {
    /// Local or server-side throttling that the caller may retry later.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. } | Self::MaxRetriesExceeded { .. })
    }

    pub fn is_payload_too_large(&self) -> bool {
        matches!(self, Self::PayloadTooLarge { .. })
    }

    pub fn is_queue_cleared(&self) -> bool {
        matches!(self, Self::QueueCleared)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Hint for when a locally rate-limited request could succeed.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Borrow the transport error if present.
    pub fn as_transport(&self) -> Option<&E> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }

    /// Take the transport error if present.
    pub fn into_transport(self) -> Option<E> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of an injected transport call that did not produce data.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError<E> {
    /// The server reported throttling (HTTP 429 or equivalent).
    #[error("server rate limited the request (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Any other failure; surfaced to the caller unchanged.
    #[error("{0}")]
    Failed(E),
}

impl<E> TransportError<E> {
    /// Build a throttling signal from a whole-second retry hint, as servers usually send it.
    pub fn rate_limited_secs(secs: u64) -> Self {
        Self::RateLimited { retry_after: Some(Duration::from_secs(secs)) }
    }
}

/// Admission-time rejection produced by the rate limiter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("rate limit exceeded for '{category}'")]
    RateLimitExceeded { category: String, retry_after: Duration },
    #[error("server throttled '{category}' on all {attempts} attempts")]
    MaxRetriesExceeded { category: String, attempts: u32 },
}

impl<E> From<Rejection> for GovernanceError<E> {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::PayloadTooLarge { size, limit } => Self::PayloadTooLarge { size, limit },
            Rejection::RateLimitExceeded { category, retry_after } => {
                Self::RateLimitExceeded { category, retry_after }
            }
            Rejection::MaxRetriesExceeded { category, attempts } => {
                Self::MaxRetriesExceeded { category, attempts }
            }
        }
    }
}

/// Failure inside the durable cache tier. Logged and absorbed, never surfaced by `issue`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DurableCacheError {
    /// The backing storage cannot be used in this environment at all.
    #[error("durable tier unavailable: {0}")]
    Unavailable(String),
    #[error("durable tier io: {0}")]
    Io(#[from] std::io::Error),
    #[error("durable tier codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl DurableCacheError {
    /// Whether the tier should be abandoned for the rest of the session.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Invalid configuration values.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
    #[error("invalid endpoint pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("malformed configuration: {0}")]
    Malformed(String),
}
