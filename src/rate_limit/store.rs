use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Persisted token-bucket state for one key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub updated_at_ms: u64,
    /// Bumped on every successful write; used for optimistic locking.
    pub version: u64,
}

/// Storage for token-bucket state.
///
/// Writers read a state, compute the refill, and commit with
/// compare-and-set on `version`, retrying when another writer won.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_state(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Commit `tokens`/`updated_at_ms` if the stored version still equals
    /// `expected_version` (`None` = key must be absent).
    ///
    /// Returns `Ok(false)` when a concurrent writer got there first.
    async fn set_state(
        &self,
        key: &str,
        tokens: f64,
        updated_at_ms: u64,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError>;
}

/// Simple in-memory token store.
#[derive(Default, Clone, Debug)]
pub struct InMemoryTokenStore {
    data: Arc<Mutex<HashMap<String, BucketState>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, BucketState>> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop buckets untouched since `cutoff_ms`; returns how many went.
    pub fn evict_idle(&self, cutoff_ms: u64) -> usize {
        let mut data = self.data();
        let before = data.len();
        data.retain(|_, state| state.updated_at_ms >= cutoff_ms);
        before - data.len()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get_state(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        Ok(self.data().get(key).copied())
    }

    async fn set_state(
        &self,
        key: &str,
        tokens: f64,
        updated_at_ms: u64,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut data = self.data();
        let current = data.get(key).map(|s| s.version);
        if current != expected_version {
            return Ok(false);
        }
        let version = expected_version.map_or(1, |v| v + 1);
        data.insert(key.to_string(), BucketState { tokens, updated_at_ms, version });
        Ok(true)
    }
}
