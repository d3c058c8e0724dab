//! Rate limiting.
//!
//! - [`RateLimiter`]: one admission decision for a key under a [`Quota`].
//! - [`TokenBucket`](strategies::TokenBucket): in-process buckets over a
//!   [`TokenStore`](store::TokenStore).
//! - [`SlidingWindow`](strategies::SlidingWindow): distributed window log
//!   over a [`SharedCache`].
//! - [`AdmissionLimiter`]: composes the per-request scopes in the fixed
//!   order global, ip, user, plan, api and stops at the first denial.
//!
//! The policy lives in a [`Snapshot`]; an update swaps in a rebuilt policy
//! and evaluations already in flight keep the one they loaded.

use crate::bus::{ConfigEvent, ConfigListener};
use crate::cache::SharedCache;
use crate::clock::Clock;
use crate::config::{Quota, RateLimitConfig};
use crate::error::{MeterError, StoreError};
use crate::model::{PlanName, UserId};
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod policy;
pub mod store;
pub mod strategies;

pub use policy::{LimitPolicy, PlanPolicyUpdate};
pub use store::{BucketState, InMemoryTokenStore, TokenStore};
pub use strategies::{SlidingWindow, TokenBucket};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        limit: u64,
        /// Permits left after this one.
        remaining: u64,
        /// Unix seconds when the scope is fully replenished.
        reset_at: u64,
    },
    /// The request is denied.
    Denied {
        limit: u64,
        reset_at: u64,
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },
}

impl Decision {
    /// Decision for a scope with no configured quota.
    pub fn unlimited() -> Self {
        Decision::Allowed { limit: 0, remaining: 0, reset_at: 0 }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn limit(&self) -> u64 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Denied { limit, .. } => *limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        match self {
            Decision::Allowed { remaining, .. } => *remaining,
            Decision::Denied { .. } => 0,
        }
    }

    pub fn reset_at(&self) -> u64 {
        match self {
            Decision::Allowed { reset_at, .. } | Decision::Denied { reset_at, .. } => *reset_at,
        }
    }

    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed { .. } => Duration::ZERO,
            Decision::Denied { retry_after, .. } => *retry_after,
        }
    }
}

/// Core interface for rate limiting logic.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one permit for `key` under `quota`.
    async fn acquire(&self, key: &str, quota: &Quota) -> Result<Decision, StoreError>;
}

/// Limiter scopes, in evaluation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Ip,
    User,
    Plan,
    Api,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Plan => "plan",
            Scope::Api => "api",
        }
    }
}

/// Who is asking and for what.
#[derive(Clone, Copy, Debug)]
pub struct Subject<'a> {
    pub user: &'a UserId,
    pub plan: &'a PlanName,
    pub ip: Option<&'a str>,
    pub method: &'a str,
    pub path: &'a str,
    pub service: &'a str,
    pub action: &'a str,
}

/// Outcome for one scope: the deciding one on denial, the plan scope (or
/// the last evaluated) on admission.
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
    pub scope: Scope,
    pub decision: Decision,
    /// Plan that selected the quota (plan scope only).
    pub plan: Option<PlanName>,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }

    /// Write the `X-RateLimit-*` and `Retry-After` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let d = &self.decision;
        if d.limit() > 0 {
            headers.insert("x-ratelimit-limit", HeaderValue::from(d.limit()));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(d.remaining()));
            headers.insert("x-ratelimit-reset", HeaderValue::from(d.reset_at()));
        }
        if let Some(plan) = &self.plan {
            if let Ok(v) = HeaderValue::from_str(plan.as_str()) {
                headers.insert("x-ratelimit-plan", v);
            }
        }
        if !d.is_allowed() {
            let secs = d.retry_after().as_millis().div_ceil(1_000).max(1);
            let secs = u64::try_from(secs).unwrap_or(u64::MAX);
            headers.insert("retry-after", HeaderValue::from(secs));
        }
    }

    /// Error for a denied verdict.
    pub fn to_error(&self) -> MeterError {
        MeterError::RateLimited {
            scope: self.scope.as_str().to_string(),
            retry_after: self.decision.retry_after(),
        }
    }
}

/// Per-request limiter composing every scope.
pub struct AdmissionLimiter {
    policy: Snapshot<LimitPolicy>,
    local: TokenBucket<InMemoryTokenStore>,
    shared: Option<SlidingWindow>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AdmissionLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLimiter")
            .field("policy", &self.policy.load())
            .field("shared", &self.shared.is_some())
            .finish()
    }
}

impl AdmissionLimiter {
    /// `cache` backs the sliding-window backend; without it every scope
    /// uses the in-process buckets.
    pub fn new(
        config: &RateLimitConfig,
        cache: Option<Arc<dyn SharedCache>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = LimitPolicy::from_config(config);
        let shared = cache.map(|c| SlidingWindow::new(c, clock.clone(), policy.window));
        Self {
            local: TokenBucket::new(Arc::new(InMemoryTokenStore::new()), clock.clone()),
            policy: Snapshot::new(policy),
            shared,
            clock,
        }
    }

    pub fn policy(&self) -> Arc<LimitPolicy> {
        self.policy.load()
    }

    /// Version of the applied policy.
    pub fn policy_version(&self) -> u64 {
        self.policy.version()
    }

    /// One decision for `scope_key` under `quota`.
    pub async fn allow(&self, scope_key: &str, quota: &Quota) -> Result<Decision, StoreError> {
        let use_shared = self.policy.load().use_shared_store;
        if let (true, Some(shared)) = (use_shared, &self.shared) {
            match shared.acquire(scope_key, quota).await {
                Ok(decision) => return Ok(decision),
                Err(e) => {
                    warn!(
                        target: "metered::rate_limit",
                        key = scope_key,
                        error = %e,
                        "shared store failed; using local bucket"
                    );
                }
            }
        }
        self.local.acquire(scope_key, quota).await
    }

    /// Plan-scope decision: the quota is selected by `plan` and counted per
    /// `(plan, method, path, user)`.
    pub async fn allow_plan(
        &self,
        plan: &PlanName,
        method: &str,
        path: &str,
        user: &UserId,
    ) -> Result<Verdict, StoreError> {
        let policy = self.policy.load();
        let Some((selected, quota)) = policy.plan_quota(plan) else {
            return Ok(Verdict { scope: Scope::Plan, decision: Decision::unlimited(), plan: None });
        };
        let key = format!("rl:plan:{selected}:{}:{path}:{user}", method.to_ascii_uppercase());
        let decision = self.allow(&key, &quota).await?;
        Ok(Verdict { scope: Scope::Plan, decision, plan: Some(selected) })
    }

    /// Evaluate every configured scope in order. Returns the denying verdict,
    /// or the plan verdict when all scopes admit.
    pub async fn check(&self, subject: &Subject<'_>) -> Result<Verdict, StoreError> {
        let policy = self.policy.load();
        let mut admitted =
            Verdict { scope: Scope::Global, decision: Decision::unlimited(), plan: None };

        let mut scopes: Vec<(Scope, String, Quota)> = Vec::with_capacity(3);
        if let Some(q) = policy.global {
            scopes.push((Scope::Global, "rl:global".to_string(), q));
        }
        if let (Some(q), Some(ip)) = (policy.ip, subject.ip) {
            scopes.push((Scope::Ip, format!("rl:ip:{ip}"), q));
        }
        if let Some(q) = policy.user {
            scopes.push((Scope::User, format!("rl:user:{}", subject.user), q));
        }
        for (scope, key, quota) in scopes {
            let decision = self.allow(&key, &quota).await?;
            let verdict = Verdict { scope, decision, plan: None };
            if !verdict.is_allowed() {
                return Ok(self.denied(subject, verdict));
            }
            admitted = verdict;
        }

        let plan = self.allow_plan(subject.plan, subject.method, subject.path, subject.user).await?;
        if !plan.is_allowed() {
            return Ok(self.denied(subject, plan));
        }
        if plan.plan.is_some() {
            admitted = plan;
        }

        if let Some(q) = policy.api_quota(subject.service, subject.action) {
            let key = format!("rl:api:{}.{}:{}", subject.service, subject.action, subject.user);
            let decision = self.allow(&key, &q).await?;
            let verdict = Verdict { scope: Scope::Api, decision, plan: None };
            if !verdict.is_allowed() {
                return Ok(self.denied(subject, verdict));
            }
        }
        debug!(
            target: "metered::rate_limit",
            user = %subject.user,
            plan = %subject.plan,
            remaining = admitted.decision.remaining(),
            "admitted"
        );
        Ok(admitted)
    }

    fn denied(&self, subject: &Subject<'_>, verdict: Verdict) -> Verdict {
        debug!(
            target: "metered::rate_limit",
            user = %subject.user,
            scope = verdict.scope.as_str(),
            retry_after_ms = verdict.decision.retry_after().as_millis() as u64,
            "denied"
        );
        verdict
    }

    /// Apply a published plan table; stale versions are ignored.
    pub fn update_plans(&self, update: &PlanPolicyUpdate) -> bool {
        if let Err(e) = update.validate() {
            warn!(
                target: "metered::rate_limit",
                version = update.version,
                error = %e,
                "plan update rejected"
            );
            return false;
        }
        let next = self.policy.load().with_plans(&update.plans);
        let applied = self.policy.store_versioned(next, update.version);
        if applied {
            info!(
                target: "metered::rate_limit",
                version = update.version,
                plans = update.plans.len(),
                "plan policies updated"
            );
        } else {
            debug!(
                target: "metered::rate_limit",
                version = update.version,
                current = self.policy.version(),
                "stale plan update ignored"
            );
        }
        applied
    }

    /// Rebuild the whole policy from configuration.
    pub fn apply_config(&self, config: &RateLimitConfig, version: u64) -> bool {
        let next = LimitPolicy::from_config(config);
        let window = next.window;
        let wants_shared = next.use_shared_store;
        let applied = self.policy.store_versioned(next, version);
        if applied {
            match &self.shared {
                Some(shared) => shared.set_window(window),
                None if wants_shared => warn!(
                    target: "metered::rate_limit",
                    "shared store requested but no cache is attached; using local buckets"
                ),
                None => {}
            }
            info!(target: "metered::rate_limit", version, "limiter policy rebuilt from config");
        }
        applied
    }

    /// Current plan table for publication, carrying the version it was
    /// applied under. Version 0 means nothing was ever applied.
    pub fn plans_update(&self) -> PlanPolicyUpdate {
        let (version, policy) = self.policy.load_versioned();
        policy.to_update(version)
    }

    /// Drop local buckets idle for longer than `horizon`.
    pub fn evict_idle(&self, horizon: Duration) -> usize {
        let horizon_ms = u64::try_from(horizon.as_millis()).unwrap_or(u64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(horizon_ms);
        self.local.store().evict_idle(cutoff)
    }
}

#[async_trait]
impl ConfigListener for AdmissionLimiter {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn on_event(&self, event: &ConfigEvent) {
        match event {
            ConfigEvent::PlanPoliciesChanged(update) => {
                self.update_plans(update);
            }
            ConfigEvent::FileChanged(config) => {
                self.apply_config(&config.rate_limit, self.clock.now_millis());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryCache, WindowCount};
    use crate::clock::ManualClock;
    use std::collections::BTreeMap;

    struct DownCache;

    #[async_trait]
    impl SharedCache for DownCache {
        async fn window_hit(
            &self,
            _: &str,
            _: u64,
            _: Duration,
        ) -> Result<WindowCount, StoreError> {
            Err(StoreError::Unavailable("redis down".into()))
        }
        async fn set_if_absent(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("redis down".into()))
        }
        async fn remove(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("redis down".into()))
        }
    }

    fn free_one_per_second() -> RateLimitConfig {
        let mut cfg = RateLimitConfig::default();
        cfg.plans.insert("FREE".into(), Quota::new(1.0, 1));
        cfg
    }

    fn subject<'a>(user: &'a UserId, plan: &'a PlanName) -> Subject<'a> {
        Subject {
            user,
            plan,
            ip: Some("10.0.0.1"),
            method: "POST",
            path: "/v1/siterank/batch:execute",
            service: "siterank",
            action: "batch",
        }
    }

    #[tokio::test]
    async fn free_plan_second_request_is_denied() {
        let clock = ManualClock::default();
        let limiter = AdmissionLimiter::new(&free_one_per_second(), None, Arc::new(clock.clone()));
        let user = UserId::from("u1");
        let plan = PlanName::free();

        let first = limiter.check(&subject(&user, &plan)).await.unwrap();
        assert!(first.is_allowed());
        assert_eq!(first.decision.remaining(), 0);
        let mut headers = HeaderMap::new();
        first.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-plan"], "FREE");

        clock.advance(Duration::from_millis(200));
        let second = limiter.check(&subject(&user, &plan)).await.unwrap();
        assert!(!second.is_allowed());
        assert_eq!(second.scope, Scope::Plan);
        let mut headers = HeaderMap::new();
        second.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-plan"], "FREE");
        let retry: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry));
    }

    #[tokio::test]
    async fn plan_counters_are_per_user() {
        let clock = ManualClock::default();
        let limiter = AdmissionLimiter::new(&free_one_per_second(), None, Arc::new(clock));
        let plan = PlanName::free();
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        assert!(limiter.check(&subject(&a, &plan)).await.unwrap().is_allowed());
        assert!(limiter.check(&subject(&b, &plan)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn global_denial_short_circuits() {
        let clock = ManualClock::default();
        let mut cfg = free_one_per_second();
        cfg.global = Some(Quota::new(1.0, 1));
        let limiter = AdmissionLimiter::new(&cfg, None, Arc::new(clock));
        let plan = PlanName::new("PRO");
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        assert!(limiter.check(&subject(&a, &plan)).await.unwrap().is_allowed());
        let denied = limiter.check(&subject(&b, &plan)).await.unwrap();
        assert_eq!(denied.scope, Scope::Global);
        assert!(denied.plan.is_none());
    }

    #[tokio::test]
    async fn api_scope_runs_last() {
        let clock = ManualClock::default();
        let mut cfg = RateLimitConfig::default();
        cfg.api.insert("siterank.batch".into(), Quota::new(1.0, 1));
        let limiter = AdmissionLimiter::new(&cfg, None, Arc::new(clock));
        let user = UserId::from("u1");
        let plan = PlanName::new("MAX");
        assert!(limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
        let denied = limiter.check(&subject(&user, &plan)).await.unwrap();
        assert_eq!(denied.scope, Scope::Api);
    }

    #[tokio::test]
    async fn shared_store_outage_falls_back_to_local() {
        let clock = ManualClock::default();
        let mut cfg = free_one_per_second();
        cfg.use_shared_store = true;
        let limiter = AdmissionLimiter::new(&cfg, Some(Arc::new(DownCache)), Arc::new(clock));
        let user = UserId::from("u1");
        let plan = PlanName::free();
        assert!(limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
        assert!(!limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn shared_window_uses_ceil_rps_times_window() {
        let clock = ManualClock::default();
        let mut cfg = free_one_per_second();
        cfg.use_shared_store = true;
        cfg.window_seconds = 3;
        let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
        let limiter = AdmissionLimiter::new(&cfg, Some(cache), Arc::new(clock));
        let user = UserId::from("u1");
        let plan = PlanName::free();
        for _ in 0..3 {
            assert!(limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
        }
        assert!(!limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn stale_plan_updates_are_ignored() {
        let clock = ManualClock::default();
        let limiter = AdmissionLimiter::new(&RateLimitConfig::default(), None, Arc::new(clock));
        let mut plans = BTreeMap::new();
        plans.insert("FREE".to_string(), Quota::new(100.0, 100));
        assert!(limiter.update_plans(&PlanPolicyUpdate { version: 10, plans: plans.clone() }));
        plans.insert("FREE".to_string(), Quota::new(1.0, 1));
        assert!(!limiter.update_plans(&PlanPolicyUpdate { version: 9, plans }));
        assert_eq!(limiter.policy().plans[&PlanName::free()], Quota::new(100.0, 100));
    }

    #[tokio::test]
    async fn unusable_plan_updates_are_rejected() {
        let clock = ManualClock::default();
        let limiter = AdmissionLimiter::new(&free_one_per_second(), None, Arc::new(clock));
        let mut plans = BTreeMap::new();
        plans.insert("FREE".to_string(), Quota::new(0.0, 1));
        assert!(!limiter.update_plans(&PlanPolicyUpdate { version: 3, plans }));
        assert_eq!(limiter.policy_version(), 0);

        let user = UserId::from("u1");
        let plan = PlanName::free();
        assert!(limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
        assert!(!limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn empty_plan_table_keeps_plan_limits() {
        let clock = ManualClock::default();
        let mut cfg = RateLimitConfig::default();
        cfg.plans.clear();
        cfg.plans.insert("FREE".into(), Quota::new(1.0, 1));
        let limiter = AdmissionLimiter::new(&cfg, None, Arc::new(clock));
        let empty = PlanPolicyUpdate { version: 5, plans: BTreeMap::new() };
        assert!(!limiter.update_plans(&empty));

        let user = UserId::from("u1");
        let plan = PlanName::free();
        assert!(limiter.check(&subject(&user, &plan)).await.unwrap().is_allowed());
        let denied = limiter.check(&subject(&user, &plan)).await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.scope, Scope::Plan);
    }

    #[tokio::test]
    async fn reload_can_switch_on_the_shared_window() {
        let clock = ManualClock::default();
        let mut cfg = free_one_per_second();
        let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
        let limiter = AdmissionLimiter::new(&cfg, Some(cache), Arc::new(clock));
        let plan = PlanName::free();

        let local = UserId::from("u1");
        assert!(limiter.check(&subject(&local, &plan)).await.unwrap().is_allowed());
        assert!(!limiter.check(&subject(&local, &plan)).await.unwrap().is_allowed());

        cfg.use_shared_store = true;
        cfg.window_seconds = 3;
        assert!(limiter.apply_config(&cfg, 7));
        let shared = UserId::from("u2");
        for _ in 0..3 {
            assert!(limiter.check(&subject(&shared, &plan)).await.unwrap().is_allowed());
        }
        assert!(!limiter.check(&subject(&shared, &plan)).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn evicts_idle_buckets() {
        let clock = ManualClock::default();
        let limiter = AdmissionLimiter::new(&free_one_per_second(), None, Arc::new(clock.clone()));
        let user = UserId::from("u1");
        let plan = PlanName::free();
        limiter.check(&subject(&user, &plan)).await.unwrap();
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(limiter.evict_idle(Duration::from_secs(600)), 1);
    }
}
