//! Configuration for a whole [`GovernanceLayer`](crate::GovernanceLayer).
//!
//! Every section defaults independently, so a JSON document only needs the fields it changes:
//!
//! ```rust
//! use fetchgate::GovernanceConfig;
//!
//! let config = GovernanceConfig::from_json_str(
//!     r#"{
//!         "rate_limit": {
//!             "categories": { "https://api.example.com": { "capacity": 10, "refill_rate_per_sec": 2.0 } }
//!         },
//!         "queue": { "max_concurrency": 8 },
//!         "cache": { "ttl_ms": 60000 }
//!     }"#,
//! )
//! .unwrap();
//! assert_eq!(config.queue.max_concurrency, 8);
//! assert_eq!(config.rate_limit.max_retries, 3);
//! ```

use crate::cache::DEFAULT_TTL_MS;
use crate::error::ConfigError;
use crate::queue::DEFAULT_MAX_CONCURRENCY;
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};

/// Namespace used by durable stores when none is configured.
pub const DEFAULT_CACHE_NAMESPACE: &str = "fetchgate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrency: DEFAULT_MAX_CONCURRENCY }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live applied to every entry.
    pub ttl_ms: u64,
    /// Keyspace for the durable tier, consumed by stores built from this config.
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_ms: DEFAULT_TTL_MS, namespace: DEFAULT_CACHE_NAMESPACE.to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
}

impl GovernanceConfig {
    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        if self.queue.max_concurrency == 0 {
            return Err(ConfigError::MustBePositive { field: "queue.max_concurrency" });
        }
        if self.cache.ttl_ms == 0 {
            return Err(ConfigError::MustBePositive { field: "cache.ttl_ms" });
        }
        Ok(())
    }
}
