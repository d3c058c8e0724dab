//! Shared cache seam used for sliding-window counting and short-lived locks.
//!
//! Production deployments back this with Redis (`metered-redis`); the
//! in-memory version serves single-node setups and tests.

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Result of one sliding-window hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowCount {
    /// Entries in the window after appending this hit.
    pub count: u64,
    /// Timestamp of the oldest entry still in the window.
    pub oldest_ms: Option<u64>,
}

#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Atomically: drop entries older than `now_ms - window`, append `now_ms`,
    /// read the cardinality, and set the key TTL to `window`.
    async fn window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
    ) -> Result<WindowCount, StoreError>;

    /// Set `key` unless it exists. Returns `true` when this call created it.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Drop expired keys; returns how many were removed. Backends that
    /// expire keys on their own keep the default.
    fn purge_expired(&self) -> usize {
        0
    }
}

#[derive(Debug)]
enum Entry {
    Window { hits: VecDeque<u64>, expires_at: u64 },
    Flag { expires_at: u64 },
}

impl Entry {
    fn expires_at(&self) -> u64 {
        match self {
            Entry::Window { expires_at, .. } | Entry::Flag { expires_at } => *expires_at,
        }
    }
}

/// Process-local [`SharedCache`].
#[derive(Debug, Clone)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Whether `key` exists and has not expired.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.entries().get(key).is_some_and(|e| e.expires_at() > now)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn window_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let window_ms = millis(window);
        let floor = now_ms.saturating_sub(window_ms);
        let mut entries = self.entries();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Window { hits: VecDeque::new(), expires_at: 0 });
        if !matches!(entry, Entry::Window { .. }) {
            *entry = Entry::Window { hits: VecDeque::new(), expires_at: 0 };
        }
        let Entry::Window { hits, expires_at } = entry else {
            return Err(StoreError::Backend(format!("{key} holds a non-window value")));
        };
        while hits.front().is_some_and(|&ts| ts <= floor) {
            hits.pop_front();
        }
        hits.push_back(now_ms);
        *expires_at = now_ms.saturating_add(window_ms);
        Ok(WindowCount { count: hits.len() as u64, oldest_ms: hits.front().copied() })
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|e| e.expires_at() > now) {
            return Ok(false);
        }
        let expires_at = now.saturating_add(millis(ttl));
        entries.insert(key.to_string(), Entry::Flag { expires_at });
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at() > now);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn window_trims_old_hits() {
        let clock = ManualClock::new(0);
        let cache = InMemoryCache::new(Arc::new(clock.clone()));
        let window = Duration::from_secs(60);
        assert_eq!(cache.window_hit("k", 1_000, window).await.unwrap().count, 1);
        assert_eq!(cache.window_hit("k", 2_000, window).await.unwrap().count, 2);
        let later = cache.window_hit("k", 61_500, window).await.unwrap();
        assert_eq!(later.count, 2);
        assert_eq!(later.oldest_ms, Some(2_000));
    }

    #[tokio::test]
    async fn set_if_absent_respects_ttl() {
        let clock = ManualClock::new(0);
        let cache = InMemoryCache::new(Arc::new(clock.clone()));
        assert!(cache.set_if_absent("lock", Duration::from_secs(10)).await.unwrap());
        assert!(!cache.set_if_absent("lock", Duration::from_secs(10)).await.unwrap());
        clock.advance(Duration::from_secs(11));
        assert!(!cache.contains("lock"));
        assert!(cache.set_if_absent("lock", Duration::from_secs(10)).await.unwrap());
        cache.remove("lock").await.unwrap();
        assert!(!cache.contains("lock"));
    }

    #[tokio::test]
    async fn purge_drops_expired_keys() {
        let clock = ManualClock::new(0);
        let cache = InMemoryCache::new(Arc::new(clock.clone()));
        cache.set_if_absent("a", Duration::from_secs(1)).await.unwrap();
        cache.set_if_absent("b", Duration::from_secs(100)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
    }
}
