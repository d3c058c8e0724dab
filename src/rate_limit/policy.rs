use crate::config::{ConfigError, Quota, RateLimitConfig};
use crate::model::PlanName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Payload of `ratelimit:plans:update`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanPolicyUpdate {
    /// Monotonic; receivers ignore versions at or below the applied one.
    pub version: u64,
    pub plans: BTreeMap<String, Quota>,
}

impl PlanPolicyUpdate {
    /// A table must name at least one plan and every quota must be usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plans.is_empty() {
            return Err(ConfigError::Invalid("plan table is empty".into()));
        }
        for (name, quota) in &self.plans {
            quota.validate(&format!("plans.{name}"))?;
        }
        Ok(())
    }
}

/// Limiter configuration in effect. Rebuilt whole and swapped in.
#[derive(Clone, Debug, PartialEq)]
pub struct LimitPolicy {
    pub window: Duration,
    pub use_shared_store: bool,
    pub default_plan: PlanName,
    pub plans: BTreeMap<PlanName, Quota>,
    pub global: Option<Quota>,
    pub ip: Option<Quota>,
    pub user: Option<Quota>,
    pub api: HashMap<String, Quota>,
}

impl LimitPolicy {
    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self {
            window: cfg.window(),
            use_shared_store: cfg.use_shared_store,
            default_plan: PlanName::new(&cfg.default_plan),
            plans: cfg.plans.iter().map(|(name, q)| (PlanName::new(name), *q)).collect(),
            global: cfg.global,
            ip: cfg.ip,
            user: cfg.user,
            api: cfg.api.iter().map(|(k, q)| (k.to_ascii_lowercase(), *q)).collect(),
        }
    }

    /// Quota for `plan`, falling back to the default plan's.
    pub fn plan_quota(&self, plan: &PlanName) -> Option<(PlanName, Quota)> {
        self.plans
            .get(plan)
            .map(|q| (plan.clone(), *q))
            .or_else(|| self.plans.get(&self.default_plan).map(|q| (self.default_plan.clone(), *q)))
    }

    pub fn api_quota(&self, service: &str, action: &str) -> Option<Quota> {
        self.api.get(&format!("{service}.{action}").to_ascii_lowercase()).copied()
    }

    /// Same policy with the plan table replaced.
    pub fn with_plans(&self, plans: &BTreeMap<String, Quota>) -> Self {
        let mut next = self.clone();
        next.plans = plans.iter().map(|(name, q)| (PlanName::new(name), *q)).collect();
        next
    }

    pub fn to_update(&self, version: u64) -> PlanPolicyUpdate {
        PlanPolicyUpdate {
            version,
            plans: self.plans.iter().map(|(name, q)| (name.to_string(), *q)).collect(),
        }
    }
}
