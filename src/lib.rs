#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # fetchgate
//!
//! Client-side governance for outbound requests: a best-effort throttle and cache that sits in
//! front of an injected transport to protect a backend and cut perceived latency.
//!
//! ## Features
//!
//! - **Token-bucket rate limiting** per origin, per named category, or per endpoint pattern
//! - **Backoff** (linear or exponential) on local exhaustion and on server-reported throttling
//! - **Payload guard** rejecting oversized request bodies before they are queued
//! - **Priority queue** with a bounded number of in-flight operations
//! - **Two-tier cache** (in-process plus a pluggable durable store) with write-through and TTL
//! - **Telemetry** through `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use fetchgate::{GovernanceLayer, Priority, Request, TransportError};
//!
//! #[tokio::main]
//! async fn main() {
//!     let layer: GovernanceLayer<String> = GovernanceLayer::builder().build().unwrap();
//!
//!     let url = "https://api.example.com/users/42";
//!     let request = Request::new(url, url).priority(Priority::HIGH);
//!     let user = layer
//!         .issue(request, || async {
//!             // Your HTTP call here.
//!             Ok::<_, TransportError<std::io::Error>>("{\"id\":42}".to_string())
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(user, "{\"id\":42}");
//!
//!     // The result is now cached under its key.
//!     assert_eq!(layer.cache_size(), 1);
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod layer;
pub mod queue;
pub mod rate_limit;
pub mod sleeper;
pub mod telemetry;

pub mod prelude;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::BackoffStrategy;
pub use cache::{CacheEntry, DurableStore, InMemoryDurableStore, StoredRecord, TieredCache};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{CacheConfig, GovernanceConfig, QueueConfig};
pub use error::{ConfigError, DurableCacheError, GovernanceError, Rejection, TransportError};
pub use layer::{GovernanceLayer, GovernanceLayerBuilder, Request};
pub use queue::{Priority, PriorityRequestQueue, ResultHandle};
pub use rate_limit::{
    BucketSpec, CategoryLimit, Decision, Descriptor, EndpointOverride, EndpointPattern,
    RateLimitConfig, RateLimitConfigUpdate, RateLimiter, RetryState, TokenBucket,
};
pub use sleeper::{AdvancingSleeper, InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use tokio_util::sync::CancellationToken;
