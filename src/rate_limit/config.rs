use super::bucket::{BucketSpec, DEFAULT_REFILL_INTERVAL_MS};
use super::pattern::EndpointPattern;
use crate::backoff::BackoffStrategy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default request body ceiling: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
/// Default number of retries after the first throttled admission.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Limits for one named category (an origin such as `https://api.example.com`, or any label the
/// caller passes as the request category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryLimit {
    pub capacity: u32,
    pub refill_rate_per_sec: f64,
    #[serde(default)]
    pub refill_interval_ms: Option<u64>,
    /// Falls back to the global `max_retries` when unset.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Falls back to the global strategy when unset.
    #[serde(default)]
    pub backoff: Option<BackoffStrategy>,
}

impl CategoryLimit {
    pub fn new(capacity: u32, refill_rate_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_sec,
            refill_interval_ms: None,
            max_retries: None,
            backoff: None,
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = Some(strategy);
        self
    }

    pub fn refill_interval_ms(mut self, interval_ms: u64) -> Self {
        self.refill_interval_ms = Some(interval_ms);
        self
    }

    fn bucket_spec(&self) -> BucketSpec {
        BucketSpec {
            capacity: self.capacity,
            refill_rate_per_sec: self.refill_rate_per_sec,
            refill_interval_ms: self.refill_interval_ms.unwrap_or(DEFAULT_REFILL_INTERVAL_MS),
        }
    }
}

/// Endpoint-specific bucket, checked in configuration order before category lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointOverride {
    pub pattern: EndpointPattern,
    pub capacity: u32,
    pub refill_rate_per_sec: f64,
}

impl EndpointOverride {
    pub fn new(pattern: EndpointPattern, capacity: u32, refill_rate_per_sec: f64) -> Self {
        Self { pattern, capacity, refill_rate_per_sec }
    }

    /// Bucket key shared by every target this override matches.
    ///
    /// Tagged by pattern kind, so a literal and a regex with the same text get separate buckets.
    pub fn key(&self) -> String {
        match &self.pattern {
            EndpointPattern::Literal(text) => format!("pattern:lit:{text}"),
            EndpointPattern::Regex(re) => format!("pattern:re:{}", re.as_str()),
        }
    }
}

/// Rate limiter settings. Mutable at runtime through [`RateLimitConfigUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket used by origins and categories without their own entry.
    pub default_limit: BucketSpec,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub max_payload_bytes: usize,
    pub categories: HashMap<String, CategoryLimit>,
    /// Ordered; first match wins.
    pub endpoint_overrides: Vec<EndpointOverride>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: BucketSpec::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffStrategy::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            categories: HashMap::new(),
            endpoint_overrides: Vec::new(),
        }
    }
}

/// Category a request resolved to, with the policy that governs it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCategory {
    pub key: String,
    pub spec: BucketSpec,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl RateLimitConfig {
    /// Map a request target onto its rate-limit category.
    ///
    /// Order: endpoint overrides (first match), an exactly configured category, the target's URL
    /// origin (configured or default), and finally the raw target with default limits.
    pub fn resolve(&self, target: &str) -> ResolvedCategory {
        if let Some(found) = self.endpoint_overrides.iter().find(|o| o.pattern.matches(target)) {
            return ResolvedCategory {
                key: found.key(),
                spec: BucketSpec::new(found.capacity, found.refill_rate_per_sec),
                max_retries: self.max_retries,
                backoff: self.backoff,
            };
        }
        if let Some(limit) = self.categories.get(target) {
            return self.from_category(target.to_string(), limit);
        }
        let key = origin_of(target).unwrap_or_else(|| target.to_string());
        match self.categories.get(&key) {
            Some(limit) => self.from_category(key, limit),
            None => ResolvedCategory {
                key,
                spec: self.default_limit,
                max_retries: self.max_retries,
                backoff: self.backoff,
            },
        }
    }

    fn from_category(&self, key: String, limit: &CategoryLimit) -> ResolvedCategory {
        ResolvedCategory {
            key,
            spec: limit.bucket_spec(),
            max_retries: limit.max_retries.unwrap_or(self.max_retries),
            backoff: limit.backoff.unwrap_or(self.backoff),
        }
    }

    /// Reject limits that would make every admission fail or divide by zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_spec(&self.default_limit, "rate_limit.default_limit")?;
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::MustBePositive { field: "rate_limit.max_payload_bytes" });
        }
        for limit in self.categories.values() {
            validate_spec(&limit.bucket_spec(), "rate_limit.categories")?;
        }
        for found in &self.endpoint_overrides {
            let spec = BucketSpec::new(found.capacity, found.refill_rate_per_sec);
            validate_spec(&spec, "rate_limit.endpoint_overrides")?;
        }
        Ok(())
    }

    /// Apply a partial update, producing the merged configuration.
    pub fn merged(&self, update: &RateLimitConfigUpdate) -> Self {
        let mut next = self.clone();
        if let Some(spec) = update.default_limit {
            next.default_limit = spec;
        }
        if let Some(retries) = update.max_retries {
            next.max_retries = retries;
        }
        if let Some(strategy) = update.backoff {
            next.backoff = strategy;
        }
        if let Some(bytes) = update.max_payload_bytes {
            next.max_payload_bytes = bytes;
        }
        for (category, limit) in &update.categories {
            next.categories.insert(category.clone(), limit.clone());
        }
        if let Some(overrides) = &update.endpoint_overrides {
            next.endpoint_overrides = overrides.clone();
        }
        next
    }
}

fn validate_spec(spec: &BucketSpec, field: &'static str) -> Result<(), ConfigError> {
    if spec.capacity == 0 || spec.refill_interval_ms == 0 {
        return Err(ConfigError::MustBePositive { field });
    }
    if !(spec.refill_rate_per_sec > 0.0) || !spec.refill_rate_per_sec.is_finite() {
        return Err(ConfigError::MustBePositive { field });
    }
    Ok(())
}

/// `scheme://host[:port]` for absolute URLs, `None` for anything else.
pub fn origin_of(target: &str) -> Option<String> {
    let parsed = url::Url::parse(target).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// Partial [`RateLimitConfig`]; `None` fields keep their current value.
///
/// `categories` entries are upserted; `endpoint_overrides`, when present, replaces the list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfigUpdate {
    pub default_limit: Option<BucketSpec>,
    pub max_retries: Option<u32>,
    pub backoff: Option<BackoffStrategy>,
    pub max_payload_bytes: Option<usize>,
    pub categories: HashMap<String, CategoryLimit>,
    pub endpoint_overrides: Option<Vec<EndpointOverride>>,
}

impl RateLimitConfigUpdate {
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = Some(strategy);
        self
    }

    pub fn max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = Some(bytes);
        self
    }

    pub fn default_limit(mut self, spec: BucketSpec) -> Self {
        self.default_limit = Some(spec);
        self
    }

    pub fn category(mut self, name: impl Into<String>, limit: CategoryLimit) -> Self {
        self.categories.insert(name.into(), limit);
        self
    }
}
