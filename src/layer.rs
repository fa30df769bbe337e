//! The composed request path: cache, then queue, then rate limiter, then transport.
//!
//! ```text
//! issue ─▶ payload guard ─▶ TieredCache::get ──hit──▶ value
//!                                │ miss
//!                                ▼
//!                  PriorityRequestQueue::enqueue
//!                                │ dispatched
//!                                ▼
//!              ┌──▶ RateLimiter::admit ──backoff──▶ sleep ─┐
//!              │         │ proceed                         │
//!              │         ▼                                 │
//!              │     transport() ──Ok──▶ write-through ──▶ value
//!              │         │ RateLimited
//!              └── server_backoff ──▶ sleep
//! ```
//!
//! Backoff waits happen while the operation holds its queue slot, so a throttled category also
//! slows the queue behind it.

use crate::cache::{DurableStore, TieredCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, GovernanceConfig, QueueConfig};
use crate::error::{ConfigError, GovernanceError, Rejection, TransportError};
use crate::queue::{Priority, PriorityRequestQueue};
use crate::rate_limit::{
    CategoryLimit, Decision, Descriptor, EndpointOverride, RateLimitConfigUpdate, RateLimiter,
    RetryState,
};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    emit_best_effort, CacheEvent, GovernanceEvent, NullSink, QueueEvent, RateLimitEvent,
    RequestOutcome, TelemetrySink,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One outbound operation as seen by the governance layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    key: String,
    category: String,
    priority: Priority,
    payload_bytes: usize,
    cacheable: bool,
    version: Option<String>,
}

impl Request {
    /// `key` identifies the result in the cache; `category` is the rate-limit target, usually the
    /// request URL or a configured category name.
    pub fn new(key: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            category: category.into(),
            priority: Priority::NORMAL,
            payload_bytes: 0,
            cacheable: true,
            version: None,
        }
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Measure `body` as its JSON encoding.
    pub fn with_body<B: Serialize + ?Sized>(self, body: &B) -> Result<Self, serde_json::Error> {
        let len = serde_json::to_vec(body)?.len();
        Ok(self.with_body_len(len))
    }

    pub fn with_body_len(mut self, bytes: usize) -> Self {
        self.payload_bytes = bytes;
        self
    }

    /// Skip both the cache lookup and the write-through.
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Store results under `version`; cached entries with another version read as misses.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }
}

struct Shared<V, S> {
    limiter: RateLimiter,
    queue: PriorityRequestQueue,
    cache: TieredCache<V>,
    cache_config: CacheConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

/// Client-side governance for an injected transport: caching, prioritised bounded concurrency,
/// and rate limiting with backoff.
///
/// Cheap to clone; clones share all state.
///
/// ```rust,no_run
/// use fetchgate::{GovernanceError, GovernanceLayer, Request, TransportError};
///
/// # async fn fetch(_url: &str) -> Result<String, TransportError<std::io::Error>> { Ok(String::new()) }
/// # async fn run() -> Result<(), GovernanceError<std::io::Error>> {
/// let layer: GovernanceLayer<String> = GovernanceLayer::builder().build().expect("valid config");
/// let url = "https://api.example.com/items/1";
/// let body = layer.issue(Request::new(url, url), move || fetch(url)).await?;
/// # let _ = body;
/// # Ok(())
/// # }
/// ```
pub struct GovernanceLayer<V, S = NullSink> {
    shared: Arc<Shared<V, S>>,
}

impl<V, S> Clone for GovernanceLayer<V, S> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<V, S> std::fmt::Debug for GovernanceLayer<V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceLayer")
            .field("limiter", &self.shared.limiter)
            .field("queue", &self.shared.queue)
            .field("cache", &self.shared.cache)
            .finish()
    }
}

impl<V> GovernanceLayer<V, NullSink>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn builder() -> GovernanceLayerBuilder<V, NullSink> {
        GovernanceLayerBuilder::new()
    }
}

impl<V, S> GovernanceLayer<V, S>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: TelemetrySink,
{
    /// Run `transport` under full governance.
    ///
    /// A fresh cache hit returns without touching the queue or the rate limiter. Otherwise the
    /// call is queued by priority, admitted by its category's bucket, and retried with backoff when
    /// either the bucket or the server throttles it. Transport failures are returned unchanged.
    pub async fn issue<T, Fut, E>(
        &self,
        request: Request,
        transport: T,
    ) -> Result<V, GovernanceError<E>>
    where
        T: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, TransportError<E>>> + Send + 'static,
        E: Send + 'static,
    {
        self.issue_with_cancel(request, CancellationToken::new(), transport).await
    }

    /// [`issue`](Self::issue), abandoned when `cancel` fires.
    ///
    /// Cancellation is observed before enqueueing, when the operation is dispatched, and during
    /// backoff waits. A transport call already in flight is not interrupted; it completes and
    /// populates the cache, but the caller gets `Cancelled`.
    pub async fn issue_with_cancel<T, Fut, E>(
        &self,
        request: Request,
        cancel: CancellationToken,
        transport: T,
    ) -> Result<V, GovernanceError<E>>
    where
        T: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, TransportError<E>>> + Send + 'static,
        E: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(GovernanceError::Cancelled);
        }
        let shared = &self.shared;
        if let Err(rejection) = shared.limiter.check_payload(request.payload_bytes) {
            shared.emit(rejected(None, &rejection)).await;
            return Err(rejection.into());
        }

        if request.cacheable {
            let hit = match request.version.as_deref() {
                Some(version) => shared.cache.get_versioned(&request.key, version).await,
                None => shared.cache.get(&request.key).await,
            };
            if let Some(entry) = hit {
                shared.emit(GovernanceEvent::Cache(CacheEvent::Hit { key: request.key })).await;
                return Ok(entry.data);
            }
            shared
                .emit(GovernanceEvent::Cache(CacheEvent::Miss { key: request.key.clone() }))
                .await;
        }

        let priority = request.priority;
        let worker = shared.clone();
        let op_cancel = cancel.clone();
        let handle = shared
            .queue
            .enqueue(move || worker.execute(request, op_cancel, transport), priority);

        tokio::select! {
            result = handle => result,
            _ = cancel.cancelled() => Err(GovernanceError::Cancelled),
        }
    }

    /// Replace or add the limits for one category.
    pub fn configure_rate_limit(
        &self,
        category: impl Into<String>,
        limit: CategoryLimit,
    ) -> Result<(), ConfigError> {
        self.shared.limiter.configure(RateLimitConfigUpdate::default().category(category, limit))
    }

    /// Add an endpoint override, replacing an existing one with the same pattern.
    pub fn configure_endpoint_override(&self, entry: EndpointOverride) -> Result<(), ConfigError> {
        self.shared.limiter.add_endpoint_override(entry)
    }

    /// Merge a partial rate-limit configuration.
    pub fn configure(&self, update: RateLimitConfigUpdate) -> Result<(), ConfigError> {
        self.shared.limiter.configure(update)
    }

    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.shared.queue.set_max_concurrency(max_concurrency);
    }

    pub async fn clear_cache(&self, key: &str) {
        self.shared.cache.delete(key).await;
    }

    pub async fn clear_all_cache(&self) {
        self.shared.cache.clear().await;
    }

    pub fn cache_size(&self) -> usize {
        self.shared.cache.len()
    }

    pub fn queue_size(&self) -> usize {
        self.shared.queue.queue_size()
    }

    pub fn active_count(&self) -> usize {
        self.shared.queue.active_count()
    }

    /// Fail every waiting operation with `QueueCleared`; returns how many were evicted.
    pub fn clear_queue(&self) -> usize {
        let evicted = self.shared.queue.clear_queue();
        if evicted > 0 {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let sink = self.shared.sink.clone();
                runtime.spawn(emit_best_effort(
                    sink,
                    GovernanceEvent::Queue(QueueEvent::Cleared { evicted }),
                ));
            }
        }
        evicted
    }

    /// Current settings, including runtime changes.
    pub fn config_snapshot(&self) -> GovernanceConfig {
        GovernanceConfig {
            rate_limit: (*self.shared.limiter.config()).clone(),
            queue: QueueConfig { max_concurrency: self.shared.queue.max_concurrency() },
            cache: self.shared.cache_config.clone(),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    pub fn cache(&self) -> &TieredCache<V> {
        &self.shared.cache
    }
}

impl<V, S> Shared<V, S>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: TelemetrySink,
{
    async fn emit(&self, event: GovernanceEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    /// Runs inside a queue slot.
    async fn execute<T, Fut, E>(
        self: Arc<Self>,
        request: Request,
        cancel: CancellationToken,
        mut transport: T,
    ) -> Result<V, GovernanceError<E>>
    where
        T: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, TransportError<E>>> + Send + 'static,
        E: Send + 'static,
    {
        let started = self.clock.now_millis();
        let descriptor =
            Descriptor::new(request.category.clone()).with_payload_bytes(request.payload_bytes);
        let mut retry = RetryState::new(request.key.clone());

        loop {
            let category = loop {
                if cancel.is_cancelled() {
                    return Err(GovernanceError::Cancelled);
                }
                match self.limiter.admit(&descriptor, &mut retry) {
                    Decision::Proceed { category, .. } => break category,
                    Decision::Backoff { category, delay, attempt } => {
                        self.emit(GovernanceEvent::RateLimit(RateLimitEvent::Throttled {
                            category,
                            attempt,
                            delay,
                        }))
                        .await;
                        self.sleep_or_cancel(delay, &cancel).await?;
                    }
                    Decision::Reject(rejection) => {
                        self.emit(rejected(Some(request.category.as_str()), &rejection)).await;
                        return Err(rejection.into());
                    }
                }
            };

            match transport().await {
                Ok(value) => {
                    if request.cacheable {
                        self.cache.set(
                            request.key.clone(),
                            value.clone(),
                            self.clock.now_millis(),
                            request.version.clone(),
                        );
                    }
                    self.emit(GovernanceEvent::Request(RequestOutcome::Success {
                        category,
                        duration: self.elapsed_since(started),
                    }))
                    .await;
                    return Ok(value);
                }
                Err(TransportError::RateLimited { retry_after }) => {
                    let attempt = retry.attempt;
                    match self.limiter.server_backoff(&mut retry, &descriptor.target, retry_after) {
                        Ok(delay) => {
                            self.emit(GovernanceEvent::RateLimit(RateLimitEvent::ServerThrottled {
                                category,
                                attempt,
                                delay,
                            }))
                            .await;
                            self.sleep_or_cancel(delay, &cancel).await?;
                        }
                        Err(rejection) => {
                            self.emit(rejected(Some(category.as_str()), &rejection)).await;
                            self.emit(GovernanceEvent::Request(RequestOutcome::Failure {
                                category,
                                duration: self.elapsed_since(started),
                            }))
                            .await;
                            return Err(rejection.into());
                        }
                    }
                }
                Err(TransportError::Failed(err)) => {
                    self.emit(GovernanceEvent::Request(RequestOutcome::Failure {
                        category,
                        duration: self.elapsed_since(started),
                    }))
                    .await;
                    return Err(GovernanceError::Transport(err));
                }
            }
        }
    }

    async fn sleep_or_cancel<E>(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), GovernanceError<E>> {
        tokio::select! {
            _ = self.sleeper.sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(GovernanceError::Cancelled),
        }
    }

    fn elapsed_since(&self, started: u64) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(started))
    }
}

fn rejected(category: Option<&str>, rejection: &Rejection) -> GovernanceEvent {
    GovernanceEvent::RateLimit(RateLimitEvent::Rejected {
        category: category.map(str::to_string),
        reason: rejection.to_string(),
    })
}

/// Builder for [`GovernanceLayer`]. Every seam defaults to its production implementation.
pub struct GovernanceLayerBuilder<V, S = NullSink> {
    config: GovernanceConfig,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    durable: Option<Arc<dyn DurableStore>>,
    sink: S,
    _value: PhantomData<fn() -> V>,
}

impl<V> GovernanceLayerBuilder<V, NullSink> {
    pub fn new() -> Self {
        Self {
            config: GovernanceConfig::default(),
            clock: None,
            sleeper: None,
            durable: None,
            sink: NullSink,
            _value: PhantomData,
        }
    }
}

impl<V> Default for GovernanceLayerBuilder<V, NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, S> GovernanceLayerBuilder<V, S>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    S: TelemetrySink,
{
    pub fn config(mut self, config: GovernanceConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`SystemClock`]; cache timestamps are persisted, so keep it epoch-based.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to [`TokioSleeper`].
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Attach a durable cache tier. Without one the cache is in-process only.
    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn telemetry<S2: TelemetrySink>(self, sink: S2) -> GovernanceLayerBuilder<V, S2> {
        GovernanceLayerBuilder {
            config: self.config,
            clock: self.clock,
            sleeper: self.sleeper,
            durable: self.durable,
            sink,
            _value: PhantomData,
        }
    }

    pub fn build(self) -> Result<GovernanceLayer<V, S>, ConfigError> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        let GovernanceConfig { rate_limit, queue, cache: cache_config } = self.config;

        let limiter = RateLimiter::new(rate_limit, clock.clone())?;
        let mut cache = TieredCache::new(cache_config.ttl_ms, clock.clone());
        if let Some(store) = self.durable {
            cache = cache.with_durable(store);
        }
        Ok(GovernanceLayer {
            shared: Arc::new(Shared {
                limiter,
                queue: PriorityRequestQueue::new(queue.max_concurrency),
                cache,
                cache_config,
                clock,
                sleeper,
                sink: self.sink,
            }),
        })
    }
}
