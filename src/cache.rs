//! Two-tier response cache.
//!
//! [`TieredCache`] keeps an in-process map in front of an optional [`DurableStore`]. Entries expire
//! lazily after the cache-wide TTL. The durable tier is strictly best-effort: reads that fail are
//! misses, writes that fail are logged and dropped, and an unavailable store is abandoned.

pub mod entry;
pub mod store;
pub mod tiered;

pub use entry::{CacheEntry, StoredRecord};
pub use store::{DurableStore, InMemoryDurableStore};
pub use tiered::{TieredCache, DEFAULT_TTL_MS};
