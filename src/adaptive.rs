//! Live-updatable configuration handles.
//!
//! Readers take an `Arc` snapshot and keep using it for the rest of their decision, so a
//! concurrent update never tears a half-applied configuration. Writers publish whole new values.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and atomic replacement for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive a new value from the current one.
    ///
    /// Uses read-copy-update: if another writer publishes in between, `f` is re-run against the
    /// newer value, so concurrent merges are never lost.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|current| f(current));
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;

    #[test]
    fn snapshots_survive_updates() {
        let config = DynamicConfig::new(vec![1]);
        let before = config.get();
        config.update(|v| {
            let mut next = v.clone();
            next.push(2);
            next
        });
        assert_eq!(*before, vec![1]);
        assert_eq!(*config.get(), vec![1, 2]);
    }

    #[test]
    fn clones_share_the_same_slot() {
        let a = DynamicConfig::new(1);
        let b = a.clone();
        b.set(7);
        assert_eq!(*a.get(), 7);
    }
}
