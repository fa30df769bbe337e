//! Abstraction for backoff waits.
//!
//! Every wait the rate limiter schedules goes through a [`Sleeper`], so tests can observe the
//! exact delays and, with [`AdvancingSleeper`], move a [`ManualClock`] forward instead of sleeping.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that doesn't actually sleep
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records every requested delay and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn record(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.record(duration);
        Box::pin(async {})
    }
}

/// Test sleeper that advances a [`ManualClock`] by the requested delay.
///
/// Backoff waits then "take" exactly as long as requested in clock time, which lets token buckets
/// refill deterministically between retries.
#[derive(Debug, Clone)]
pub struct AdvancingSleeper {
    clock: ManualClock,
    tracker: TrackingSleeper,
}

impl AdvancingSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, tracker: TrackingSleeper::new() }
    }

    /// Delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.tracker.calls()
    }
}

impl Sleeper for AdvancingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.tracker.record(duration);
        self.clock.advance(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        // Yield so other tasks observe the new time before this one resumes.
        Box::pin(tokio::task::yield_now())
    }
}
