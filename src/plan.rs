//! Plan registry: resolves a user's active plan and owns subscription
//! status transitions.
//!
//! Lookups are cached per user for a short TTL (never past the
//! subscription's `ended_at`). Every write evicts the local entry and
//! publishes `user:plan:invalidate` so other replicas follow.

use crate::bus::{ConfigEvent, ConfigListener};
use crate::clock::Clock;
use crate::error::{MeterError, StoreError};
use crate::model::{Plan, PlanId, PlanName, PlanStatus, Subscription, SubscriptionId, UserId};
use crate::pubsub::{PubSub, USER_PLAN_INVALIDATE};
use crate::store::SubscriptionStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
struct CachedPlan {
    plan: PlanName,
    expires_at_ms: u64,
}

pub struct PlanRegistry {
    store: Arc<dyn SubscriptionStore>,
    pubsub: Arc<dyn PubSub>,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<UserId, CachedPlan>>,
    ttl_ms: AtomicU64,
}

impl std::fmt::Debug for PlanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanRegistry").field("cached", &self.cached_users()).finish()
    }
}

/// Store errors caused by the caller's arguments become client input errors.
fn operator_error(e: StoreError) -> MeterError {
    match e {
        StoreError::NotFound(what) => MeterError::ClientInput(format!("{what} not found")),
        StoreError::Invalid(why) => MeterError::ClientInput(why),
        other => MeterError::Dependency(other),
    }
}

fn to_millis(ts: DateTime<Utc>) -> u64 {
    u64::try_from(ts.timestamp_millis()).unwrap_or(0)
}

impl PlanRegistry {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        pubsub: Arc<dyn PubSub>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            pubsub,
            clock,
            cache: RwLock::new(HashMap::new()),
            ttl_ms: AtomicU64::new(u64::try_from(cache_ttl.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn cached_users(&self) -> usize {
        self.cache.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drop cache entries past their expiry; returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_millis();
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        let before = cache.len();
        cache.retain(|_, hit| hit.expires_at_ms > now_ms);
        before - cache.len()
    }

    /// Active plan name of `user`; `FREE` when nothing active resolves.
    pub async fn plan(&self, user: &UserId) -> PlanName {
        let now_ms = self.clock.now_millis();
        let cached = self.cache.read().unwrap_or_else(|p| p.into_inner()).get(user).cloned();
        if let Some(hit) = cached.filter(|hit| hit.expires_at_ms > now_ms) {
            return hit.plan;
        }
        let (plan, valid_until_ms) = match self.store.active_subscription(user).await {
            Ok(Some((sub, plan))) => {
                let ends_ms = to_millis(sub.ended_at);
                if ends_ms < now_ms {
                    debug!(
                        target: "metered::plan",
                        %user,
                        sub_id = sub.id,
                        "active subscription past ended_at"
                    );
                    (PlanName::free(), None)
                } else {
                    (plan.name, Some(ends_ms))
                }
            }
            Ok(None) => (PlanName::free(), None),
            Err(e) => {
                warn!(target: "metered::plan", %user, error = %e, "plan lookup failed; using FREE");
                return PlanName::free();
            }
        };
        let mut expires_at_ms = now_ms.saturating_add(self.ttl_ms.load(Ordering::Relaxed));
        if let Some(until) = valid_until_ms {
            expires_at_ms = expires_at_ms.min(until.saturating_add(1));
        }
        self.cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user.clone(), CachedPlan { plan: plan.clone(), expires_at_ms });
        plan
    }

    async fn active_plan(&self, id: PlanId) -> Result<Plan, MeterError> {
        match self.store.plan(id).await? {
            Some(plan) if plan.status == PlanStatus::Active => Ok(plan),
            Some(_) => Err(MeterError::ClientInput(format!("plan {id} is inactive"))),
            None => Err(MeterError::ClientInput(format!("plan {id} not found"))),
        }
    }

    /// Make `plan_id` the user's only active subscription for `days`.
    pub async fn assign(
        &self,
        user: &UserId,
        plan_id: PlanId,
        days: u32,
    ) -> Result<Subscription, MeterError> {
        if days == 0 {
            return Err(MeterError::ClientInput("days must be positive".into()));
        }
        let plan = self.active_plan(plan_id).await?;
        let now = self.clock.now();
        let sub = self
            .store
            .assign(user, plan_id, now, now + ChronoDuration::days(i64::from(days)))
            .await
            .map_err(operator_error)?;
        info!(
            target: "metered::plan",
            %user,
            plan = %plan.name,
            sub_id = sub.id,
            days,
            "plan assigned"
        );
        self.evict_and_publish(user).await;
        Ok(sub)
    }

    pub async fn cancel(&self, sub_id: SubscriptionId) -> Result<Subscription, MeterError> {
        let sub = self.store.cancel(sub_id, self.clock.now()).await.map_err(operator_error)?;
        info!(target: "metered::plan", user = %sub.user_id, sub_id, "subscription cancelled");
        self.evict_and_publish(&sub.user_id).await;
        Ok(sub)
    }

    /// Push `ended_at` out by `days`, counting from now if already lapsed.
    pub async fn renew(
        &self,
        sub_id: SubscriptionId,
        days: u32,
    ) -> Result<Subscription, MeterError> {
        if days == 0 {
            return Err(MeterError::ClientInput("days must be positive".into()));
        }
        let current = self
            .store
            .subscription(sub_id)
            .await?
            .ok_or_else(|| MeterError::ClientInput(format!("subscription {sub_id} not found")))?;
        let now = self.clock.now();
        let ended_at = current.ended_at.max(now) + ChronoDuration::days(i64::from(days));
        let sub = self.store.extend(sub_id, ended_at, now).await.map_err(operator_error)?;
        info!(
            target: "metered::plan",
            user = %sub.user_id,
            sub_id,
            ended_at = %sub.ended_at,
            "subscription renewed"
        );
        self.evict_and_publish(&sub.user_id).await;
        Ok(sub)
    }

    pub async fn change(
        &self,
        sub_id: SubscriptionId,
        new_plan_id: PlanId,
    ) -> Result<Subscription, MeterError> {
        let plan = self.active_plan(new_plan_id).await?;
        let sub = self
            .store
            .change_plan(sub_id, new_plan_id, self.clock.now())
            .await
            .map_err(operator_error)?;
        info!(
            target: "metered::plan",
            user = %sub.user_id,
            sub_id,
            plan = %plan.name,
            "subscription plan changed"
        );
        self.evict_and_publish(&sub.user_id).await;
        Ok(sub)
    }

    /// Drop one user's cached plan, or every entry when `user` is `None`.
    pub fn invalidate(&self, user: Option<&UserId>) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        match user {
            Some(u) => {
                cache.remove(u);
            }
            None => cache.clear(),
        }
    }

    async fn evict_and_publish(&self, user: &UserId) {
        self.invalidate(Some(user));
        if let Err(e) = self.pubsub.publish(USER_PLAN_INVALIDATE, user.as_str()).await {
            warn!(
                target: "metered::plan",
                %user,
                error = %e,
                "failed to publish plan invalidation"
            );
        }
    }

    /// Move every lapsed `ACTIVE` subscription to `EXPIRED`.
    pub async fn expire_subscriptions(&self) -> Result<Vec<Subscription>, MeterError> {
        let moved = self.store.expire_due(self.clock.now()).await?;
        for sub in &moved {
            self.evict_and_publish(&sub.user_id).await;
        }
        if !moved.is_empty() {
            info!(target: "metered::plan", count = moved.len(), "subscriptions expired");
        }
        Ok(moved)
    }

    /// Active subscriptions whose `ended_at` falls in the next `days` days.
    pub async fn ending_within(&self, days: u32) -> Result<Vec<Subscription>, MeterError> {
        let now = self.clock.now();
        Ok(self.store.ending_between(now, now + ChronoDuration::days(i64::from(days))).await?)
    }
}

#[async_trait]
impl ConfigListener for PlanRegistry {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn on_event(&self, event: &ConfigEvent) {
        match event {
            ConfigEvent::UserPlanInvalidated(user) => self.invalidate(user.as_ref()),
            ConfigEvent::FileChanged(config) => {
                self.set_cache_ttl(Duration::from_secs(config.plan.cache_ttl_seconds));
            }
            _ => {}
        }
    }
}
