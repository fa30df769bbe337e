use super::bucket::TokenBucket;
use super::config::{EndpointOverride, RateLimitConfig, RateLimitConfigUpdate, ResolvedCategory};
use crate::adaptive::DynamicConfig;
use crate::backoff::BackoffStrategy;
use crate::clock::Clock;
use crate::error::{ConfigError, Rejection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Retry hint assumed when the server throttles without saying for how long.
pub const DEFAULT_SERVER_RETRY_HINT: Duration = Duration::from_secs(1);

/// What the limiter needs to know about an outbound operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// URL or category label used to pick the bucket.
    pub target: String,
    /// Serialized request body size in bytes.
    pub payload_bytes: usize,
}

impl Descriptor {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), payload_bytes: 0 }
    }

    pub fn with_payload_bytes(mut self, bytes: usize) -> Self {
        self.payload_bytes = bytes;
        self
    }
}

/// Per-operation retry bookkeeping; dropped when the operation reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub key: String,
    /// Retries already scheduled for this operation (local and server throttling combined).
    pub attempt: u32,
    pub strategy: BackoffStrategy,
}

impl RetryState {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), attempt: 0, strategy: BackoffStrategy::default() }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A token was taken; the operation may run now.
    Proceed {
        category: String,
        /// Whole tokens left in the bucket.
        remaining: u32,
    },
    /// The bucket is empty; wait `delay` and ask again.
    Backoff { category: String, delay: Duration, attempt: u32 },
    /// Terminal: do not retry.
    Reject(Rejection),
}

impl Decision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed { .. })
    }
}

/// Keyed token-bucket admission control.
///
/// Buckets are created lazily, one per resolved category key, and live as long as the limiter.
/// Configuration can be replaced at any time; each admission works from the snapshot it read.
#[derive(Debug)]
pub struct RateLimiter {
    config: DynamicConfig<RateLimitConfig>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: DynamicConfig::new(config),
            buckets: Mutex::new(HashMap::new()),
            clock,
        })
    }

    // Bucket updates never leave a half-applied state, so a poisoned lock is still usable.
    fn buckets(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.get()
    }

    /// Merge `update` over the current settings. Applies to subsequent admissions only.
    pub fn configure(&self, update: RateLimitConfigUpdate) -> Result<(), ConfigError> {
        let candidate = self.config.get().merged(&update);
        candidate.validate()?;
        self.config.update(|current| current.merged(&update));
        tracing::debug!(target: "fetchgate::rate_limit", ?update, "rate limit configuration updated");
        Ok(())
    }

    /// Add an endpoint override after the existing ones, replacing any override with the same
    /// pattern in place.
    pub fn add_endpoint_override(&self, entry: EndpointOverride) -> Result<(), ConfigError> {
        let mut candidate = (*self.config.get()).clone();
        upsert_override(&mut candidate.endpoint_overrides, entry.clone());
        candidate.validate()?;
        let key = entry.key();
        self.config.update(|current| {
            let mut next = current.clone();
            upsert_override(&mut next.endpoint_overrides, entry.clone());
            next
        });
        tracing::debug!(target: "fetchgate::rate_limit", %key, "endpoint override configured");
        Ok(())
    }

    /// Size guard. Bypasses buckets and backoff entirely.
    pub fn check_payload(&self, payload_bytes: usize) -> Result<(), Rejection> {
        let limit = self.config.get().max_payload_bytes;
        if payload_bytes > limit {
            return Err(Rejection::PayloadTooLarge { size: payload_bytes, limit });
        }
        Ok(())
    }

    /// Category a target resolves to under the current configuration.
    pub fn resolve(&self, target: &str) -> ResolvedCategory {
        self.config.get().resolve(target)
    }

    /// Decide whether `descriptor` may run now.
    ///
    /// On an empty bucket the retry counter in `retry` is advanced and a backoff delay returned,
    /// until the category's `max_retries` is reached.
    pub fn admit(&self, descriptor: &Descriptor, retry: &mut RetryState) -> Decision {
        if let Err(rejection) = self.check_payload(descriptor.payload_bytes) {
            return Decision::Reject(rejection);
        }
        let resolved = self.resolve(&descriptor.target);
        retry.strategy = resolved.backoff;
        let now = self.clock.now_millis();

        let wait = {
            let mut buckets = self.buckets();
            let bucket = buckets
                .entry(resolved.key.clone())
                .or_insert_with(|| TokenBucket::new(resolved.spec, now));
            if *bucket.spec() != resolved.spec {
                bucket.reconfigure(resolved.spec);
            }
            if bucket.try_consume(now) {
                let remaining = bucket.available(now) as u32;
                return Decision::Proceed { category: resolved.key, remaining };
            }
            bucket.time_until_next_token(now)
        };

        if retry.attempt >= resolved.max_retries {
            return Decision::Reject(Rejection::RateLimitExceeded {
                category: resolved.key,
                retry_after: wait,
            });
        }
        let attempt = retry.attempt;
        let delay = resolved.backoff.delay(wait, attempt);
        retry.attempt += 1;
        tracing::debug!(
            target: "fetchgate::rate_limit",
            category = %resolved.key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "bucket empty, backing off"
        );
        Decision::Backoff { category: resolved.key, delay, attempt }
    }

    /// Delay before resubmitting after the server itself reported throttling.
    ///
    /// `category` is the request target or an already resolved key. `hint` is the server's
    /// retry-after value, if it sent one.
    pub fn server_backoff(
        &self,
        retry: &mut RetryState,
        category: &str,
        hint: Option<Duration>,
    ) -> Result<Duration, Rejection> {
        let resolved = self.resolve(category);
        retry.strategy = resolved.backoff;
        if retry.attempt >= resolved.max_retries {
            return Err(Rejection::MaxRetriesExceeded {
                category: resolved.key,
                attempts: retry.attempt + 1,
            });
        }
        let attempt = retry.attempt;
        let delay =
            resolved.backoff.delay(hint.unwrap_or(DEFAULT_SERVER_RETRY_HINT), attempt);
        retry.attempt += 1;
        tracing::debug!(
            target: "fetchgate::rate_limit",
            category = %resolved.key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "server throttled, backing off"
        );
        Ok(delay)
    }

    /// Tokens currently available for `target`'s category, if its bucket exists yet.
    pub fn available_tokens(&self, target: &str) -> Option<f64> {
        let key = self.resolve(target).key;
        let now = self.clock.now_millis();
        let mut buckets = self.buckets();
        buckets.get_mut(&key).map(|bucket| bucket.available(now))
    }

    /// Number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets().len()
    }
}

fn upsert_override(overrides: &mut Vec<EndpointOverride>, entry: EndpointOverride) {
    match overrides.iter_mut().find(|existing| existing.pattern == entry.pattern) {
        Some(existing) => *existing = entry,
        None => overrides.push(entry),
    }
}
