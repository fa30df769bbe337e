//! Convenient re-exports for common fetchgate types.
pub use crate::{
    backoff::BackoffStrategy,
    cache::{DurableStore, TieredCache},
    config::GovernanceConfig,
    error::{GovernanceError, TransportError},
    layer::{GovernanceLayer, Request},
    queue::Priority,
    rate_limit::{CategoryLimit, EndpointOverride, EndpointPattern, RateLimitConfigUpdate},
    telemetry::{GovernanceEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    CancellationToken,
};
