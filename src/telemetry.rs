//! Telemetry for the governance layer.
//!
//! Every governed request emits structured [`GovernanceEvent`]s. Events flow through
//! [`TelemetrySink`] implementations which can log, collect, or forward them.
//!
//! # Event Types
//!
//! - **Cache**: `Hit`, `Miss`
//! - **Rate limit**: `Throttled` (local bucket empty), `ServerThrottled`, `Rejected`
//! - **Queue**: `Cleared`
//! - **All requests**: `Success`, `Failure`
//!
//! # Telemetry Sinks
//!
//! `TelemetrySink` is a `tower::Service<GovernanceEvent>` so sinks compose with ordinary tower
//! code.
//!
//! ```rust
//! use fetchgate::telemetry::{GovernanceEvent, RateLimitEvent};
//! use std::time::Duration;
//!
//! let throttled = GovernanceEvent::RateLimit(RateLimitEvent::Throttled {
//!     category: "https://api.example.com".into(),
//!     attempt: 0,
//!     delay: Duration::from_millis(500),
//! });
//! assert!(throttled.to_string().contains("500ms"));
//! ```

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes governance events.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use fetchgate::telemetry::{GovernanceEvent, TelemetrySink};
/// use std::future::Future;
/// use std::pin::Pin;
/// use std::task::{Context, Poll};
/// use tower::Service;
///
/// #[derive(Clone)]
/// struct PrintSink;
///
/// impl Service<GovernanceEvent> for PrintSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: GovernanceEvent) -> Self::Future {
///         println!("{event}");
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl TelemetrySink for PrintSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait TelemetrySink:
    Service<GovernanceEvent, Response = (), Error = Self::SinkError, Future = SinkFuture<Self::SinkError>>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Boxed future returned by every sink.
pub type SinkFuture<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry never blocks or fails a request: if a sink is not ready or errors, the event is
/// dropped.
pub async fn emit_best_effort<S>(sink: S, event: GovernanceEvent)
where
    S: Service<GovernanceEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted while governing requests.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernanceEvent {
    Cache(CacheEvent),
    RateLimit(RateLimitEvent),
    Queue(QueueEvent),
    Request(RequestOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Hit { key: String },
    Miss { key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitEvent {
    /// The category's bucket was empty; the request waits `delay` before re-checking.
    Throttled { category: String, attempt: u32, delay: Duration },
    /// The transport reported throttling; the request waits `delay` before resubmitting.
    ServerThrottled { category: String, attempt: u32, delay: Duration },
    /// The request was refused without reaching the transport.
    Rejected { category: Option<String>, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Waiting operations evicted by `clear_queue`.
    Cleared { evicted: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Success { category: String, duration: Duration },
    Failure { category: String, duration: Duration },
}

impl fmt::Display for GovernanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernanceEvent::Cache(e) => write!(f, "Cache::{e}"),
            GovernanceEvent::RateLimit(e) => write!(f, "RateLimit::{e}"),
            GovernanceEvent::Queue(e) => write!(f, "Queue::{e}"),
            GovernanceEvent::Request(e) => write!(f, "Request::{e}"),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { key } => write!(f, "Hit({key})"),
            CacheEvent::Miss { key } => write!(f, "Miss({key})"),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Throttled { category, attempt, delay } => {
                write!(f, "Throttled({category}, attempt #{attempt}, delay={delay:?})")
            }
            RateLimitEvent::ServerThrottled { category, attempt, delay } => {
                write!(f, "ServerThrottled({category}, attempt #{attempt}, delay={delay:?})")
            }
            RateLimitEvent::Rejected { category: Some(category), reason } => {
                write!(f, "Rejected({category}: {reason})")
            }
            RateLimitEvent::Rejected { category: None, reason } => write!(f, "Rejected({reason})"),
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Cleared { evicted } => write!(f, "Cleared(evicted={evicted})"),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { category, duration } => {
                write!(f, "Success({category}, duration={duration:?})")
            }
            RequestOutcome::Failure { category, duration } => {
                write!(f, "Failure({category}, duration={duration:?})")
            }
        }
    }
}

// ============================================================================
// Built-in Telemetry Sinks
// ============================================================================

/// A no-op telemetry sink that discards all events. The default for a governance layer.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<GovernanceEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GovernanceEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<GovernanceEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GovernanceEvent) -> Self::Future {
        tracing::info!(target: "fetchgate::telemetry", event = %event, "governance_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Bounded; the oldest events are evicted once capacity is reached.
///
/// ```rust
/// use fetchgate::telemetry::{GovernanceEvent, MemorySink, QueueEvent};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = GovernanceEvent::Queue(QueueEvent::Cleared { evicted: 3 });
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<GovernanceEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<GovernanceEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GovernanceEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GovernanceEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Error type for composed telemetry sinks.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Sends every event to two sinks concurrently. Either sink failing fails the call.
///
/// ```rust
/// use fetchgate::telemetry::{LogSink, MemorySink, MulticastSink};
///
/// let memory = MemorySink::new();
/// let _combined = MulticastSink::new(LogSink, memory.clone());
/// ```
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<GovernanceEvent> for MulticastSink<A, B>
where
    A: TelemetrySink,
    A::SinkError: Sync,
    B: TelemetrySink,
    B::SinkError: Sync,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GovernanceEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: TelemetrySink,
    A::SinkError: Sync,
    B: TelemetrySink,
    B::SinkError: Sync,
{
    type SinkError = ComposedSinkError;
}
