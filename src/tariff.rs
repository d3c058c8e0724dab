//! Tariff registry: prices `(service, action)` pairs in tokens per unit.
//!
//! The live index is the compiled-in defaults overlaid with every active
//! database row. It is rebuilt on a miss, after the reload TTL, on every
//! local write, and whenever `token:rules:update` arrives on the bus.
//! Unknown pairs are a hard denial, never free.

use crate::bus::{ConfigEvent, ConfigListener};
use crate::clock::Clock;
use crate::error::{MeterError, StoreError};
use crate::model::{NewTariffRule, TariffRule};
use crate::pubsub::{PubSub, TOKEN_RULES_UPDATE};
use crate::snapshot::Snapshot;
use crate::store::RuleStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Built-in prices: `(service, action, token_cost, description)`.
pub const DEFAULT_TARIFFS: &[(&str, &str, u32, &str)] = &[
    ("siterank", "query", 1, "domain rank lookup, per domain"),
    ("siterank", "batch", 1, "batch rank lookup, per domain"),
    ("batchopen", "basic", 1, "batch URL open, per URL"),
    ("batchopen", "silent", 2, "silent batch URL open, per URL"),
    ("batchopen", "proxy", 3, "proxied batch URL open, per URL"),
    ("autoclick", "execute", 1, "auto-click run, per click"),
    ("adscenter", "update", 2, "ad link update, per ad"),
    ("adscenter", "sync", 1, "ad account sync, per account"),
];

fn index_key(service: &str, action: &str) -> String {
    format!("{}|{}", service.trim().to_ascii_lowercase(), action.trim().to_ascii_lowercase())
}

#[derive(Debug, Default)]
struct TariffIndex {
    rules: HashMap<String, TariffRule>,
    loaded_at_ms: Option<u64>,
}

impl TariffIndex {
    fn build(db_rows: Vec<TariffRule>, now_ms: u64) -> Self {
        let mut rules = HashMap::with_capacity(DEFAULT_TARIFFS.len() + db_rows.len());
        for (service, action, cost, description) in DEFAULT_TARIFFS {
            rules.insert(
                index_key(service, action),
                TariffRule {
                    id: 0,
                    service: (*service).to_string(),
                    action: (*action).to_string(),
                    token_cost: *cost,
                    is_active: true,
                    description: (*description).to_string(),
                },
            );
        }
        for row in db_rows.into_iter().filter(|r| r.is_active) {
            rules.insert(index_key(&row.service, &row.action), row);
        }
        Self { rules, loaded_at_ms: Some(now_ms) }
    }
}

pub struct TariffRegistry {
    store: Arc<dyn RuleStore>,
    pubsub: Arc<dyn PubSub>,
    clock: Arc<dyn Clock>,
    index: Snapshot<TariffIndex>,
    ttl_ms: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
    /// Held across read and swap so an older read never lands last.
    reload_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TariffRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TariffRegistry")
            .field("rules", &self.index.load().rules.len())
            .field("ttl_ms", &self.ttl_ms.load(Ordering::Relaxed))
            .finish()
    }
}

impl TariffRegistry {
    pub fn new(
        store: Arc<dyn RuleStore>,
        pubsub: Arc<dyn PubSub>,
        clock: Arc<dyn Clock>,
        reload_ttl: Duration,
    ) -> Self {
        Self {
            store,
            pubsub,
            clock,
            index: Snapshot::new(TariffIndex::default()),
            ttl_ms: AtomicU64::new(u64::try_from(reload_ttl.as_millis()).unwrap_or(u64::MAX)),
            write_lock: tokio::sync::Mutex::new(()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn set_reload_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn is_fresh(&self, index: &TariffIndex) -> bool {
        match index.loaded_at_ms {
            Some(at) => {
                self.clock.now_millis().saturating_sub(at) < self.ttl_ms.load(Ordering::Relaxed)
            }
            None => false,
        }
    }

    /// Tokens per unit for `(service, action)`.
    pub async fn price(&self, service: &str, action: &str) -> Result<u32, MeterError> {
        let key = index_key(service, action);
        let current = self.index.load();
        if self.is_fresh(&current) {
            if let Some(rule) = current.rules.get(&key) {
                return Ok(rule.token_cost);
            }
        }
        match self.reload().await {
            Ok(()) => {}
            Err(e) => match current.rules.get(&key) {
                Some(rule) => {
                    warn!(
                        target: "metered::tariff",
                        service,
                        action,
                        error = %e,
                        "reload failed; serving stale price"
                    );
                    return Ok(rule.token_cost);
                }
                None => return Err(e.into()),
            },
        }
        self.index
            .load()
            .rules
            .get(&key)
            .map(|rule| rule.token_cost)
            .ok_or_else(|| MeterError::TariffNotFound {
                service: service.to_string(),
                action: action.to_string(),
            })
    }

    /// Current index, sorted by `(service, action)`.
    pub fn list(&self) -> Vec<TariffRule> {
        let mut rules: Vec<_> = self.index.load().rules.values().cloned().collect();
        rules.sort_by(|a, b| (&a.service, &a.action).cmp(&(&b.service, &b.action)));
        rules
    }

    /// Rebuild the index from defaults and the active database rows.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let _serial = self.reload_lock.lock().await;
        let rows = self.store.active_rules().await?;
        let db_rows = rows.len();
        let index = TariffIndex::build(rows, self.clock.now_millis());
        let total = index.rules.len();
        self.index.store(index);
        info!(target: "metered::tariff", db_rows, total, "tariff index rebuilt");
        Ok(())
    }

    /// Insert or update a rule, rebuild locally, and notify other replicas.
    pub async fn upsert(&self, rule: NewTariffRule) -> Result<TariffRule, MeterError> {
        if rule.service.trim().is_empty() || rule.action.trim().is_empty() {
            return Err(MeterError::ClientInput("service and action are required".into()));
        }
        let _guard = self.write_lock.lock().await;
        let saved = self.store.upsert_rule(rule).await?;
        self.after_write().await?;
        info!(
            target: "metered::tariff",
            service = %saved.service,
            action = %saved.action,
            token_cost = saved.token_cost,
            "tariff rule upserted"
        );
        Ok(saved)
    }

    /// Deactivate a database rule. A built-in default for the same pair
    /// becomes effective again.
    pub async fn disable(&self, id: i64) -> Result<TariffRule, MeterError> {
        let _guard = self.write_lock.lock().await;
        let saved = self.store.set_rule_active(id, false).await?;
        self.after_write().await?;
        info!(
            target: "metered::tariff",
            id,
            service = %saved.service,
            action = %saved.action,
            "tariff rule disabled"
        );
        Ok(saved)
    }

    async fn after_write(&self) -> Result<(), StoreError> {
        self.reload().await?;
        if let Err(e) = self.pubsub.publish(TOKEN_RULES_UPDATE, "reload").await {
            warn!(
                target: "metered::tariff",
                error = %e,
                "failed to publish rule update; peers converge on TTL"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigListener for TariffRegistry {
    fn name(&self) -> &'static str {
        "tariff"
    }

    async fn on_event(&self, event: &ConfigEvent) {
        match event {
            ConfigEvent::TariffRulesChanged => {
                if let Err(e) = self.reload().await {
                    warn!(
                        target: "metered::tariff",
                        error = %e,
                        "reload after rules update failed"
                    );
                }
            }
            ConfigEvent::FileChanged(config) => {
                self.set_reload_ttl(Duration::from_secs(config.tariff.reload_ttl_seconds));
                debug!(
                    target: "metered::tariff",
                    ttl_s = config.tariff.reload_ttl_seconds,
                    "reload ttl updated"
                );
            }
            _ => {}
        }
    }
}
