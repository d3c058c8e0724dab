//! Configuration for the metered core.
//!
//! Every knob has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! [rate_limit]
//! window_seconds = 60
//! use_shared_store = true
//!
//! [rate_limit.plans.FREE]
//! rps = 1.0
//! burst = 1
//!
//! [rate_limit.api."siterank.batch"]
//! rps = 20.0
//! burst = 40
//! ```

use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Sustained rate and burst for one limiter scope.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub rps: f64,
    pub burst: u32,
}

impl Quota {
    pub const fn new(rps: f64, burst: u32) -> Self {
        Self { rps, burst }
    }

    /// Sliding-window limit: `ceil(rps * window_seconds)`.
    pub fn window_limit(&self, window: Duration) -> u64 {
        (self.rps * window.as_secs_f64()).ceil().max(1.0) as u64
    }

    /// Rejects non-finite or non-positive rates and a zero burst.
    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if !self.rps.is_finite() || self.rps <= 0.0 {
            return Err(ConfigError::Invalid(format!("{scope}: rps must be positive")));
        }
        if self.burst == 0 {
            return Err(ConfigError::Invalid(format!("{scope}: burst must be positive")));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub use_shared_store: bool,
    /// Plan whose quota applies when the resolved plan has none.
    pub default_plan: String,
    pub plans: BTreeMap<String, Quota>,
    pub global: Option<Quota>,
    pub ip: Option<Quota>,
    pub user: Option<Quota>,
    /// Keyed by `service.action`.
    pub api: BTreeMap<String, Quota>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let plans = [
            ("FREE".to_string(), Quota::new(2.0, 5)),
            ("PRO".to_string(), Quota::new(10.0, 20)),
            ("MAX".to_string(), Quota::new(50.0, 100)),
        ]
        .into_iter()
        .collect();
        Self {
            window_seconds: 60,
            use_shared_store: false,
            default_plan: "FREE".into(),
            plans,
            global: None,
            ip: None,
            user: None,
            api: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_days: u32,
    pub pending_lock_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_days: 7, pending_lock_seconds: 600 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TariffConfig {
    pub reload_ttl_seconds: u64,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self { reload_ttl_seconds: 300 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub cache_ttl_seconds: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { cache_ttl_seconds: 30 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerRetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LedgerRetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 50, max_delay_ms: 1_000 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub retry: LedgerRetryConfig,
    pub balance_cache_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { retry: LedgerRetryConfig::default(), balance_cache_ms: 1_000 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    pub handler_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub finalize_timeout_ms: u64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self { handler_timeout_ms: 30_000, operation_timeout_ms: 2_000, finalize_timeout_ms: 5_000 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub path: Option<PathBuf>,
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { path: None, debounce_ms: 500, poll_interval_ms: 250 }
    }
}

/// Six-field cron expressions: `sec min hour day-of-month month day-of-week`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub refresh_rate_limits: String,
    pub expire_subscriptions: String,
    pub gc_idempotency: String,
    pub reconcile_orphans: String,
    pub reminder: String,
    pub prune_caches: String,
    pub reminder_days: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            refresh_rate_limits: "0 * * * * *".into(),
            expire_subscriptions: "0 5 0 * * *".into(),
            gc_idempotency: "0 0 * * * *".into(),
            reconcile_orphans: "0 */10 * * * *".into(),
            reminder: "0 0 9 * * *".into(),
            prune_caches: "30 * * * * *".into(),
            reminder_days: 3,
        }
    }
}

impl JobsConfig {
    /// `(job name, cron expression)` pairs.
    pub fn schedules(&self) -> [(&'static str, &str); 6] {
        [
            ("refresh_rate_limits", self.refresh_rate_limits.as_str()),
            ("expire_subscriptions", self.expire_subscriptions.as_str()),
            ("gc_idempotency", self.gc_idempotency.as_str()),
            ("reconcile_orphans", self.reconcile_orphans.as_str()),
            ("reminder", self.reminder.as_str()),
            ("prune_caches", self.prune_caches.as_str()),
        ]
    }
}

/// Parse a cron expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr)
        .map_err(|e| ConfigError::Invalid(format!("invalid schedule {expr:?}: {e}")))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub rate_limit: RateLimitConfig,
    pub idempotency: IdempotencyConfig,
    pub tariff: TariffConfig,
    pub plan: PlanConfig,
    pub ledger: LedgerConfig,
    pub envelope: EnvelopeConfig,
    pub watch: WatchConfig,
    pub jobs: JobsConfig,
}

impl MeterConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: MeterConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if rl.window_seconds == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_seconds must be positive".into()));
        }
        for (name, quota) in &rl.plans {
            quota.validate(&format!("rate_limit.plans.{name}"))?;
        }
        for (api, quota) in &rl.api {
            if !api.contains('.') {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.api key {api:?} must be service.action"
                )));
            }
            quota.validate(&format!("rate_limit.api.{api}"))?;
        }
        for (scope, quota) in [("global", &rl.global), ("ip", &rl.ip), ("user", &rl.user)] {
            if let Some(q) = quota {
                q.validate(&format!("rate_limit.{scope}"))?;
            }
        }
        if self.idempotency.ttl_days == 0 {
            return Err(ConfigError::Invalid("idempotency.ttl_days must be positive".into()));
        }
        if self.idempotency.pending_lock_seconds == 0 {
            return Err(ConfigError::Invalid(
                "idempotency.pending_lock_seconds must be positive".into(),
            ));
        }
        if self.tariff.reload_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("tariff.reload_ttl_seconds must be positive".into()));
        }
        if self.plan.cache_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("plan.cache_ttl_seconds must be positive".into()));
        }
        if self.ledger.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("ledger.retry.max_attempts must be positive".into()));
        }
        let env = &self.envelope;
        if env.handler_timeout_ms == 0
            || env.operation_timeout_ms == 0
            || env.finalize_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("envelope timeouts must be positive".into()));
        }
        for (_, expr) in self.jobs.schedules() {
            parse_schedule(expr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = MeterConfig::from_toml("").unwrap();
        assert_eq!(cfg, MeterConfig::default());
        assert_eq!(cfg.rate_limit.window_seconds, 60);
        assert_eq!(cfg.idempotency.ttl_days, 7);
        assert_eq!(cfg.idempotency.pending_lock_seconds, 600);
        assert_eq!(cfg.tariff.reload_ttl_seconds, 300);
        assert_eq!(cfg.ledger.retry.max_attempts, 3);
        assert_eq!(cfg.watch.debounce_ms, 500);
    }

    #[test]
    fn parses_plan_and_api_quotas() {
        let cfg = MeterConfig::from_toml(
            r#"
            [rate_limit]
            use_shared_store = true

            [rate_limit.plans.FREE]
            rps = 1.0
            burst = 1

            [rate_limit.api."siterank.batch"]
            rps = 20.0
            burst = 40

            [rate_limit.user]
            rps = 5.0
            burst = 10
            "#,
        )
        .unwrap();
        assert!(cfg.rate_limit.use_shared_store);
        assert_eq!(cfg.rate_limit.plans["FREE"], Quota::new(1.0, 1));
        assert!(!cfg.rate_limit.plans.contains_key("PRO"));
        assert_eq!(cfg.rate_limit.api["siterank.batch"].burst, 40);
        assert_eq!(cfg.rate_limit.user, Some(Quota::new(5.0, 10)));
    }

    #[test]
    fn rejects_non_positive_rates() {
        let err = MeterConfig::from_toml(
            r#"
            [rate_limit.plans.FREE]
            rps = 0.0
            burst = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_cron() {
        let err = MeterConfig::from_toml("[jobs]\nreminder = \"every morning\"\n").unwrap_err();
        assert!(err.to_string().contains("invalid schedule"));
    }

    #[test]
    fn rejects_zero_window() {
        let err = MeterConfig::from_toml("[rate_limit]\nwindow_seconds = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn window_limit_rounds_up() {
        let q = Quota::new(0.5, 1);
        assert_eq!(q.window_limit(Duration::from_secs(61)), 31);
        assert_eq!(Quota::new(1.0, 1).window_limit(Duration::from_secs(60)), 60);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.toml");
        std::fs::write(&path, "[plan]\ncache_ttl_seconds = 5\n").unwrap();
        let cfg = MeterConfig::load(&path).unwrap();
        assert_eq!(cfg.plan.cache_ttl_seconds, 5);
    }
}
