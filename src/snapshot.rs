//! Lock-free, versioned cells for live-updatable state.
//!
//! Readers take a cheap `Arc` snapshot and keep using it for the rest of
//! their evaluation; writers build a complete replacement and swap it in.
//! An in-flight reader therefore never observes a half-applied update.
//! The version travels in the same swapped pointer as the value, so a
//! version and the value it stamps are always published together.

use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug)]
struct Versioned<T> {
    version: u64,
    value: Arc<T>,
}

/// `Snapshot<T>` gives cheap reads and swap-on-rebuild updates.
#[derive(Debug)]
pub struct Snapshot<T> {
    inner: Arc<ArcSwap<Versioned<T>>>,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Snapshot<T> {
    /// Create a cell holding `value` at version 0.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(Versioned {
                version: 0,
                value: Arc::new(value),
            })),
        }
    }

    /// Current value.
    pub fn load(&self) -> Arc<T> {
        self.inner.load().value.clone()
    }

    /// Current value together with the version it was stored under.
    pub fn load_versioned(&self) -> (u64, Arc<T>) {
        let cur = self.inner.load();
        (cur.version, cur.value.clone())
    }

    /// Replace the value; returns the new version.
    pub fn store(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let prev = self.inner.rcu(|cur| Versioned {
            version: cur.version.saturating_add(1),
            value: value.clone(),
        });
        prev.version.saturating_add(1)
    }

    /// Replace the value only if `version` is newer than the current one.
    /// Returns `false` for stale updates.
    pub fn store_versioned(&self, value: T, version: u64) -> bool {
        let next = Arc::new(Versioned { version, value: Arc::new(value) });
        loop {
            let current = self.inner.load_full();
            if version <= current.version {
                return false;
            }
            let prev = self.inner.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&*prev, &current) {
                return true;
            }
        }
    }

    /// Rebuild from the current value.
    pub fn update<F>(&self, f: F) -> u64
    where
        F: Fn(&T) -> T,
    {
        let prev = self.inner.rcu(|cur| Versioned {
            version: cur.version.saturating_add(1),
            value: Arc::new(f(&cur.value)),
        });
        prev.version.saturating_add(1)
    }

    /// Number of applied updates (or the last external version).
    pub fn version(&self) -> u64 {
        self.inner.load().version
    }
}
