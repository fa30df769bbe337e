use super::entry::StoredRecord;
use crate::error::DurableCacheError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Abstract storage interface for the durable cache tier.
///
/// Implementations hold one namespaced keyspace of [`StoredRecord`]s. Any error is absorbed by
/// the [`TieredCache`](super::TieredCache); returning [`DurableCacheError::Unavailable`] makes the
/// cache stop using the tier for the rest of the session.
#[async_trait]
pub trait DurableStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, key: &str) -> Result<Option<StoredRecord>, DurableCacheError>;

    async fn store(&self, key: &str, record: StoredRecord) -> Result<(), DurableCacheError>;

    async fn remove(&self, key: &str) -> Result<(), DurableCacheError>;

    async fn clear(&self) -> Result<(), DurableCacheError>;
}

/// Simple in-memory durable store.
///
/// Clones share the same data, so a second cache built over a clone sees what the first one
/// persisted. Availability can be toggled to exercise the fast-tier-only fallback.
#[derive(Default, Clone, Debug)]
pub struct InMemoryDurableStore {
    data: Arc<Mutex<HashMap<String, StoredRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Unavailable` (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Raw record, bypassing any cache.
    pub fn record(&self, key: &str) -> Option<StoredRecord> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), DurableCacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DurableCacheError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn load(&self, key: &str) -> Result<Option<StoredRecord>, DurableCacheError> {
        self.check()?;
        Ok(self.record(key))
    }

    async fn store(&self, key: &str, record: StoredRecord) -> Result<(), DurableCacheError> {
        self.check()?;
        self.data.lock().unwrap_or_else(PoisonError::into_inner).insert(key.to_string(), record);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), DurableCacheError> {
        self.check()?;
        self.data.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), DurableCacheError> {
        self.check()?;
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}
