//! Client-side rate limiting.
//!
//! The building blocks:
//! - [`TokenBucket`]: pure token-bucket state machine for one key.
//! - [`RateLimiter`]: keyed buckets plus admission decisions, backoff on local exhaustion,
//!   backoff on server-reported throttling, and the payload size guard.
//! - [`RateLimitConfig`]: defaults, per-category limits, and ordered endpoint overrides.
//!
//! # Architecture
//!
//! - **Resolution**: a request target (URL or category label) resolves to a category key. Endpoint
//!   overrides are tried first, in order, then exact category names, then the URL origin.
//! - **Decision**: [`RateLimiter::admit`] is synchronous and never sleeps. It returns a
//!   [`Decision`]; the caller owns the wait, so backoff waits are the only suspension points.
//! - **State**: buckets are private to the limiter and created lazily on first use of a key.

pub mod bucket;
pub mod config;
pub mod limiter;
pub mod pattern;

pub use bucket::{BucketSpec, TokenBucket, DEFAULT_REFILL_INTERVAL_MS};
pub use config::{
    origin_of, CategoryLimit, EndpointOverride, RateLimitConfig, RateLimitConfigUpdate,
    ResolvedCategory, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_RETRIES,
};
pub use limiter::{Decision, Descriptor, RateLimiter, RetryState, DEFAULT_SERVER_RETRY_HINT};
pub use pattern::EndpointPattern;
