use super::entry::{CacheEntry, StoredRecord};
use super::store::DurableStore;
use crate::clock::Clock;
use crate::error::DurableCacheError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};

/// Five minutes.
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

const TARGET: &str = "fetchgate::cache";

enum WriteOp {
    Store { key: String, record: StoredRecord },
    Remove { key: String },
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Durable tier handle plus the detached writer that applies writes in submission order.
struct Durable {
    store: Arc<dyn DurableStore>,
    available: Arc<AtomicBool>,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
}

impl Durable {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn submit(&self, op: WriteOp) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(target: TARGET, "no tokio runtime; durable write skipped");
            return;
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let op = match writer.as_ref() {
            Some(tx) => match tx.send(op) {
                Ok(()) => return,
                // The writer died with its runtime; start a fresh one below.
                Err(mpsc::error::SendError(op)) => op,
            },
            None => op,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_writer(self.store.clone(), self.available.clone(), rx));
        // The receiver was just created and is alive.
        let _ = tx.send(op);
        *writer = Some(tx);
    }

    async fn flush(&self) {
        let pending = self.writer.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        if !pending {
            return;
        }
        let (done, wait) = oneshot::channel();
        self.submit(WriteOp::Flush(done));
        // A closed channel means the writer is gone and nothing is left to apply.
        let _ = wait.await;
    }
}

async fn run_writer(
    store: Arc<dyn DurableStore>,
    available: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        if !available.load(Ordering::Acquire) {
            if let WriteOp::Flush(done) = op {
                let _ = done.send(());
            }
            continue;
        }
        let (action, key, result) = match op {
            WriteOp::Store { key, record } => {
                let result = store.store(&key, record).await;
                ("store", Some(key), result)
            }
            WriteOp::Remove { key } => {
                let result = store.remove(&key).await;
                ("remove", Some(key), result)
            }
            WriteOp::Clear => ("clear", None, store.clear().await),
            WriteOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        // Sole consumer of durable write results. Errors stop here: the fast tier already
        // holds the value for this session.
        if let Err(err) = result {
            record_failure(&available, action, key.as_deref(), &err);
        }
    }
}

fn record_failure(available: &AtomicBool, action: &str, key: Option<&str>, err: &DurableCacheError) {
    if err.is_unavailable() {
        if available.swap(false, Ordering::AcqRel) {
            tracing::warn!(target: TARGET, action, error = %err, "durable tier unavailable; continuing with fast tier only");
        }
    } else {
        tracing::debug!(target: TARGET, action, key = key.unwrap_or("*"), error = %err, "durable tier operation failed");
    }
}

/// Durable reads in flight, per key. Any write to a key bumps its generation, so a read that
/// started earlier can tell its result is stale before promoting it.
#[derive(Default)]
struct PendingLoads {
    loads: Mutex<HashMap<String, PendingLoad>>,
}

#[derive(Default)]
struct PendingLoad {
    readers: usize,
    generation: u64,
}

impl PendingLoads {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingLoad>> {
        self.loads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, key: &str) -> LoadTicket<'_> {
        let mut loads = self.lock();
        let load = loads.entry(key.to_string()).or_default();
        load.readers += 1;
        LoadTicket { pending: self, key: key.to_string(), generation: load.generation }
    }

    fn invalidate(&self, key: &str) {
        if let Some(load) = self.lock().get_mut(key) {
            load.generation += 1;
        }
    }

    fn invalidate_all(&self) {
        for load in self.lock().values_mut() {
            load.generation += 1;
        }
    }
}

struct LoadTicket<'a> {
    pending: &'a PendingLoads,
    key: String,
    generation: u64,
}

impl LoadTicket<'_> {
    fn is_stale(&self) -> bool {
        self.pending.lock().get(&self.key).map_or(true, |load| load.generation != self.generation)
    }
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        let mut loads = self.pending.lock();
        if let Some(load) = loads.get_mut(&self.key) {
            load.readers -= 1;
            if load.readers == 0 {
                loads.remove(&self.key);
            }
        }
    }
}

/// Two-level cache: an in-process map in front of an optional [`DurableStore`].
///
/// * Reads hit the fast tier first and return without awaiting anything when it holds a valid
///   entry. A fast-tier miss consults the durable tier and promotes what it finds.
/// * Writes land in the fast tier synchronously; the durable write is queued to a detached writer
///   task so same-key writes apply in call order (last write wins).
/// * Expired entries read as absent but are not purged.
/// * Durable failures never reach the caller. An `Unavailable` error switches the cache to
///   fast-tier-only for the rest of its life.
pub struct TieredCache<V> {
    fast: RwLock<HashMap<String, CacheEntry<V>>>,
    pending: PendingLoads,
    durable: Option<Durable>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<V> std::fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("entries", &self.fast.read().unwrap_or_else(PoisonError::into_inner).len())
            .field("ttl_ms", &self.ttl_ms)
            .field("durable", &self.durable.as_ref().map(|d| d.is_available()))
            .finish()
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Fast-tier-only cache.
    pub fn new(ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            fast: RwLock::new(HashMap::new()),
            pending: PendingLoads::default(),
            durable: None,
            ttl_ms,
            clock,
        }
    }

    /// Attach a durable tier.
    pub fn with_durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(Durable {
            store,
            available: Arc::new(AtomicBool::new(true)),
            writer: Mutex::new(None),
        });
        self
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Whether a durable tier is attached and still in use.
    pub fn durable_available(&self) -> bool {
        self.durable.as_ref().is_some_and(Durable::is_available)
    }

    /// Number of fast-tier entries, including expired ones not yet overwritten.
    pub fn len(&self) -> usize {
        self.fast.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fast tier only; never touches the durable tier.
    pub fn get_fast(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now_millis();
        let fast = self.fast.read().unwrap_or_else(PoisonError::into_inner);
        fast.get(key).filter(|entry| entry.is_valid(now)).cloned()
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        if let Some(hit) = self.get_fast(key) {
            tracing::trace!(target: TARGET, key, "fast tier hit");
            return Some(hit);
        }
        let durable = self.durable.as_ref().filter(|d| d.is_available())?;

        let ticket = self.pending.begin(key);
        let record = match durable.store.load(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(err) => {
                record_failure(&durable.available, "load", Some(key), &err);
                return None;
            }
        };
        let data = match serde_json::from_value::<V>(record.data) {
            Ok(data) => data,
            Err(err) => {
                record_failure(&durable.available, "decode", Some(key), &DurableCacheError::from(err));
                return None;
            }
        };
        let entry = CacheEntry {
            key: key.to_string(),
            data,
            timestamp: record.timestamp,
            ttl_ms: self.ttl_ms,
            version: record.version,
        };
        let now = self.clock.now_millis();
        if !entry.is_valid(now) {
            return None;
        }

        let mut fast = self.fast.write().unwrap_or_else(PoisonError::into_inner);
        // A set, delete or clear that ran while the durable read was in flight is newer.
        if ticket.is_stale() {
            return fast.get(key).filter(|current| current.is_valid(now)).cloned();
        }
        if let Some(current) = fast.get(key).filter(|current| current.is_valid(now)) {
            return Some(current.clone());
        }
        tracing::debug!(target: TARGET, key, "durable tier hit; promoted");
        fast.insert(key.to_string(), entry.clone());
        Some(entry)
    }

    /// Like [`get`](Self::get), but an entry stored under a different version reads as absent.
    pub async fn get_versioned(&self, key: &str, version: &str) -> Option<CacheEntry<V>> {
        self.get(key).await.filter(|entry| entry.version.as_deref() == Some(version))
    }

    /// Write-through. The fast tier is updated before this returns; the durable write is queued.
    pub fn set(&self, key: impl Into<String>, data: V, timestamp: u64, version: Option<String>) {
        let key = key.into();
        let durable_value = match self.durable.as_ref().filter(|d| d.is_available()) {
            Some(_) => match serde_json::to_value(&data) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::debug!(target: TARGET, key = %key, error = %err, "value not serializable; fast tier only");
                    None
                }
            },
            None => None,
        };

        let entry = CacheEntry {
            key: key.clone(),
            data,
            timestamp,
            ttl_ms: self.ttl_ms,
            version: version.clone(),
        };
        {
            let mut fast = self.fast.write().unwrap_or_else(PoisonError::into_inner);
            fast.insert(key.clone(), entry);
            self.pending.invalidate(&key);
        }

        if let (Some(durable), Some(data)) = (self.durable.as_ref(), durable_value) {
            durable.submit(WriteOp::Store { key, record: StoredRecord { data, timestamp, version } });
        }
    }

    /// Remove `key` from both tiers. Returns once the durable tier has applied the removal.
    pub async fn delete(&self, key: &str) {
        {
            let mut fast = self.fast.write().unwrap_or_else(PoisonError::into_inner);
            fast.remove(key);
            self.pending.invalidate(key);
        }
        if let Some(durable) = self.durable.as_ref().filter(|d| d.is_available()) {
            durable.submit(WriteOp::Remove { key: key.to_string() });
            durable.flush().await;
        }
    }

    /// Empty both tiers. Rate-limit and queue state are untouched.
    pub async fn clear(&self) {
        {
            let mut fast = self.fast.write().unwrap_or_else(PoisonError::into_inner);
            fast.clear();
            self.pending.invalidate_all();
        }
        if let Some(durable) = self.durable.as_ref().filter(|d| d.is_available()) {
            durable.submit(WriteOp::Clear);
            durable.flush().await;
        }
    }

    /// Wait until every durable write issued so far has been applied (or dropped).
    pub async fn flush(&self) {
        if let Some(durable) = self.durable.as_ref() {
            durable.flush().await;
        }
    }
}
