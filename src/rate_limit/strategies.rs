use crate::cache::SharedCache;
use crate::clock::Clock;
use crate::config::Quota;
use crate::error::StoreError;
use crate::rate_limit::store::TokenStore;
use crate::rate_limit::{Decision, RateLimiter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CAS_ATTEMPTS: usize = 16;

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

/// A token bucket per key.
///
/// Refills at `quota.rps` tokens per second up to `quota.burst`; a key
/// seen for the first time starts full.
pub struct TokenBucket<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> TokenBucket<S>
where
    S: TokenStore + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<S> RateLimiter for TokenBucket<S>
where
    S: TokenStore + 'static,
{
    async fn acquire(&self, key: &str, quota: &Quota) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        let rate = quota.rps;
        let capacity = f64::from(quota.burst);
        let limit = u64::from(quota.burst);
        if !rate.is_finite() || rate <= 0.0 || limit == 0 {
            return Err(StoreError::Backend(format!(
                "unusable quota for {key}: rps {rate}, burst {limit}"
            )));
        }

        for _ in 0..CAS_ATTEMPTS {
            let (current_tokens, last_updated, version) = match self.store.get_state(key).await? {
                Some(s) => (s.tokens, s.updated_at_ms, Some(s.version)),
                None => (capacity, now, None),
            };

            let elapsed_secs = now.saturating_sub(last_updated) as f64 / 1_000.0;
            let tokens = (current_tokens + elapsed_secs * rate).min(capacity);

            if tokens >= 1.0 {
                let left = tokens - 1.0;
                if self.store.set_state(key, left, now.max(last_updated), version).await? {
                    let to_full_ms = ((capacity - left) / rate * 1_000.0).ceil() as u64;
                    return Ok(Decision::Allowed {
                        limit,
                        remaining: left.floor() as u64,
                        reset_at: ceil_secs(now.saturating_add(to_full_ms)),
                    });
                }
                // Lost the race; re-read.
            } else {
                let wait = Duration::try_from_secs_f64((1.0 - tokens) / rate)
                    .unwrap_or(Duration::MAX);
                let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
                return Ok(Decision::Denied {
                    limit,
                    reset_at: ceil_secs(now.saturating_add(wait_ms)),
                    retry_after: wait,
                });
            }
        }

        // Persistent contention: deny rather than over-admit.
        Ok(Decision::Denied {
            limit,
            reset_at: ceil_secs(now.saturating_add(100)),
            retry_after: Duration::from_millis(100),
        })
    }
}

/// Sliding-window log over a [`SharedCache`].
///
/// Each call appends a hit to the key's window and admits iff the window
/// holds at most `ceil(rps * window_seconds)` hits. Denied hits stay in the
/// window.
pub struct SlidingWindow {
    cache: Arc<dyn SharedCache>,
    clock: Arc<dyn Clock>,
    window_ms: AtomicU64,
}

impl SlidingWindow {
    pub fn new(cache: Arc<dyn SharedCache>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        let window_ms = AtomicU64::new(u64::try_from(window.as_millis()).unwrap_or(u64::MAX));
        Self { cache, clock, window_ms }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.load(Ordering::Relaxed))
    }

    pub fn set_window(&self, window: Duration) {
        let ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.window_ms.store(ms, Ordering::Relaxed);
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    async fn acquire(&self, key: &str, quota: &Quota) -> Result<Decision, StoreError> {
        let window = self.window();
        let window_ms = self.window_ms.load(Ordering::Relaxed);
        let now = self.clock.now_millis();
        let limit = quota.window_limit(window);
        let hit = self.cache.window_hit(key, now, window).await?;
        let frees_at = hit.oldest_ms.unwrap_or(now).saturating_add(window_ms);
        if hit.count <= limit {
            Ok(Decision::Allowed {
                limit,
                remaining: limit - hit.count,
                reset_at: ceil_secs(frees_at),
            })
        } else {
            let wait_ms = frees_at.saturating_sub(now).clamp(1, window_ms.max(1));
            Ok(Decision::Denied {
                limit,
                reset_at: ceil_secs(frees_at),
                retry_after: Duration::from_millis(wait_ms),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::InMemoryTokenStore;

    fn bucket(clock: &ManualClock) -> TokenBucket<InMemoryTokenStore> {
        TokenBucket::new(Arc::new(InMemoryTokenStore::new()), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn bucket_starts_full_and_drains() {
        let clock = ManualClock::default();
        let tb = bucket(&clock);
        let quota = Quota::new(1.0, 2);
        assert_eq!(tb.acquire("k", &quota).await.unwrap().remaining(), 1);
        assert_eq!(tb.acquire("k", &quota).await.unwrap().remaining(), 0);
        let denied = tb.acquire("k", &quota).await.unwrap();
        assert!(!denied.is_allowed());
        assert!(denied.retry_after() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let clock = ManualClock::default();
        let tb = bucket(&clock);
        let quota = Quota::new(1.0, 1);
        assert!(tb.acquire("k", &quota).await.unwrap().is_allowed());
        assert!(!tb.acquire("k", &quota).await.unwrap().is_allowed());
        clock.advance(Duration::from_millis(1_000));
        assert!(tb.acquire("k", &quota).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn unusable_rates_are_refused_without_panicking() {
        let clock = ManualClock::default();
        clock.set_millis(u64::MAX - 10);
        let tb = bucket(&clock);
        for quota in [Quota::new(0.0, 1), Quota::new(-2.0, 1), Quota::new(f64::NAN, 1)] {
            let err = tb.acquire("k", &quota).await.unwrap_err();
            assert!(matches!(err, StoreError::Backend(_)), "{err:?}");
        }
        assert!(tb.acquire("k", &Quota::new(1.0, 0)).await.is_err());
    }

    #[tokio::test]
    async fn reset_time_saturates_near_the_end_of_time() {
        let clock = ManualClock::default();
        clock.set_millis(u64::MAX - 10);
        let tb = bucket(&clock);
        let quota = Quota::new(0.001, 1);
        let allowed = tb.acquire("k", &quota).await.unwrap();
        assert!(allowed.is_allowed());
        let denied = tb.acquire("k", &quota).await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.reset_at(), ceil_secs(u64::MAX));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let clock = ManualClock::default();
        let tb = bucket(&clock);
        let quota = Quota::new(1.0, 1);
        assert!(tb.acquire("a", &quota).await.unwrap().is_allowed());
        assert!(tb.acquire("b", &quota).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn window_admits_up_to_limit() {
        let clock = ManualClock::default();
        let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
        let sw = SlidingWindow::new(cache, Arc::new(clock.clone()), Duration::from_secs(10));
        let quota = Quota::new(0.3, 1); // ceil(0.3 * 10) = 3
        for expected_remaining in [2, 1, 0] {
            let d = sw.acquire("k", &quota).await.unwrap();
            assert!(d.is_allowed());
            assert_eq!(d.remaining(), expected_remaining);
            assert_eq!(d.limit(), 3);
        }
        let denied = sw.acquire("k", &quota).await.unwrap();
        assert!(!denied.is_allowed());
        assert!(denied.retry_after() <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn window_slides() {
        let clock = ManualClock::default();
        let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
        let sw = SlidingWindow::new(cache, Arc::new(clock.clone()), Duration::from_secs(1));
        let quota = Quota::new(1.0, 1);
        assert!(sw.acquire("k", &quota).await.unwrap().is_allowed());
        assert!(!sw.acquire("k", &quota).await.unwrap().is_allowed());
        clock.advance(Duration::from_millis(1_001));
        assert!(sw.acquire("k", &quota).await.unwrap().is_allowed());
    }
}
