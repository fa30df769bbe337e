use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default refill granularity.
pub const DEFAULT_REFILL_INTERVAL_MS: u64 = 1_000;

/// Shape of a bucket: how many tokens it holds and how fast it refills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub capacity: u32,
    pub refill_rate_per_sec: f64,
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

fn default_refill_interval_ms() -> u64 {
    DEFAULT_REFILL_INTERVAL_MS
}

impl BucketSpec {
    pub fn new(capacity: u32, refill_rate_per_sec: f64) -> Self {
        Self { capacity, refill_rate_per_sec, refill_interval_ms: DEFAULT_REFILL_INTERVAL_MS }
    }

    pub fn with_refill_interval_ms(mut self, interval_ms: u64) -> Self {
        self.refill_interval_ms = interval_ms;
        self
    }
}

impl Default for BucketSpec {
    fn default() -> Self {
        Self::new(10, 2.0)
    }
}

/// Token bucket for a single rate-limited key.
///
/// A pure state machine: every operation takes the current time in milliseconds and performs a
/// lazy refill first. Refill only ever adds whole tokens, in steps of at least one
/// `refill_interval_ms`, and never beyond `capacity`. Consumption removes exactly one token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    spec: BucketSpec,
    tokens: f64,
    last_refill_at: u64,
}

impl TokenBucket {
    /// A full bucket whose refill clock starts at `now_ms`.
    pub fn new(spec: BucketSpec, now_ms: u64) -> Self {
        Self { tokens: f64::from(spec.capacity), spec, last_refill_at: now_ms }
    }

    pub fn spec(&self) -> &BucketSpec {
        &self.spec
    }

    /// Tokens currently held, after refilling up to `now_ms`.
    pub fn available(&mut self, now_ms: u64) -> f64 {
        self.refill(now_ms);
        self.tokens
    }

    /// Take one token if available. No side effect beyond the refill on failure.
    pub fn try_consume(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Zero if a token is available now, otherwise the estimated time until one is.
    pub fn time_until_next_token(&mut self, now_ms: u64) -> Duration {
        self.refill(now_ms);
        if self.tokens >= 1.0 || self.spec.refill_rate_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - self.tokens;
        let millis = (missing / self.spec.refill_rate_per_sec * self.spec.refill_interval_ms as f64)
            .ceil();
        Duration::from_millis(millis as u64)
    }

    /// Adopt new limits. Held tokens are clamped to the new capacity; refill timing is kept.
    pub fn reconfigure(&mut self, spec: BucketSpec) {
        self.spec = spec;
        self.tokens = self.tokens.min(f64::from(spec.capacity));
    }

    fn refill(&mut self, now_ms: u64) {
        let interval = self.spec.refill_interval_ms.max(1);
        let elapsed = now_ms.saturating_sub(self.last_refill_at);
        if elapsed < interval {
            return;
        }
        let earned = (elapsed as f64 / interval as f64 * self.spec.refill_rate_per_sec).floor();
        // Rates below one token per interval accumulate elapsed time until a whole token is due.
        if earned >= 1.0 {
            self.tokens = (self.tokens + earned).min(f64::from(self.spec.capacity));
            self.last_refill_at = now_ms;
        }
    }
}
