//! Wiring: builds every component from one [`MeterConfig`] and a set of
//! backends, and owns the background tasks.

use crate::audit::AuditSink;
use crate::bus::ConfigBus;
use crate::cache::{InMemoryCache, SharedCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, MeterConfig};
use crate::envelope::{Envelope, EnvelopeParts, EnvelopeSettings};
use crate::error::MeterError;
use crate::idempotency::IdempotencyKeeper;
use crate::identity::{IdentityResolver, TrustedIdentity};
use crate::jobs::{
    standard_schedule, ExpireSubscriptions, GcIdempotency, PruneCaches, ReconcileOrphans,
    RefreshRateLimits, ReminderNotifier, RenewalReminder, TracingNotifier,
};
use crate::ledger::TokenLedger;
use crate::plan::PlanRegistry;
use crate::pubsub::{InMemoryPubSub, PubSub};
use crate::rate_limit::AdmissionLimiter;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::{IdempotencyStore, LedgerStore, MemoryStore, RuleStore, SubscriptionStore};
use crate::tariff::TariffRegistry;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Storage, cache and pub/sub the core runs on.
#[derive(Clone)]
pub struct Backends {
    pub rules: Arc<dyn RuleStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub audit: Arc<dyn AuditSink>,
    pub cache: Arc<dyn SharedCache>,
    pub pubsub: Arc<dyn PubSub>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    /// Everything in process, backed by one [`MemoryStore`].
    pub fn in_memory(store: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: store.clone(),
            subscriptions: store.clone(),
            ledger: store.clone(),
            idempotency: store.clone(),
            audit: store,
            cache: Arc::new(InMemoryCache::new(clock)),
            pubsub: Arc::new(InMemoryPubSub::new()),
        }
    }
}

pub struct MeteredCoreBuilder {
    config: MeterConfig,
    backends: Option<Backends>,
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn ReminderNotifier>,
}

impl MeteredCoreBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backends(mut self, backends: Backends) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ReminderNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Result<MeteredCore, ConfigError> {
        let cfg = self.config;
        cfg.validate()?;
        let clock = self.clock;
        let backends = self
            .backends
            .unwrap_or_else(|| {
                Backends::in_memory(Arc::new(MemoryStore::new(clock.clone())), clock.clone())
            });

        let tariffs = Arc::new(TariffRegistry::new(
            backends.rules.clone(),
            backends.pubsub.clone(),
            clock.clone(),
            Duration::from_secs(cfg.tariff.reload_ttl_seconds),
        ));
        let plans = Arc::new(PlanRegistry::new(
            backends.subscriptions.clone(),
            backends.pubsub.clone(),
            clock.clone(),
            Duration::from_secs(cfg.plan.cache_ttl_seconds),
        ));
        // The window is always wired; `use_shared_store` picks it per call.
        let limiter = Arc::new(AdmissionLimiter::new(
            &cfg.rate_limit,
            Some(backends.cache.clone()),
            clock.clone(),
        ));
        let idempotency = Arc::new(IdempotencyKeeper::new(
            backends.idempotency.clone(),
            backends.cache.clone(),
            clock.clone(),
            Duration::from_secs(u64::from(cfg.idempotency.ttl_days) * 86_400),
            Duration::from_secs(cfg.idempotency.pending_lock_seconds),
        ));
        let retry = &cfg.ledger.retry;
        let ledger = Arc::new(TokenLedger::new(
            backends.ledger.clone(),
            tariffs.clone(),
            clock.clone(),
            RetryPolicy::new(
                retry.max_attempts,
                Backoff::exponential(
                    Duration::from_millis(retry.base_delay_ms),
                    Duration::from_millis(retry.max_delay_ms),
                ),
            ),
            Duration::from_millis(cfg.ledger.balance_cache_ms),
        ));
        let envelope = Envelope::new(EnvelopeParts {
            identity: self.identity,
            plans: plans.clone(),
            limiter: limiter.clone(),
            idempotency: idempotency.clone(),
            ledger: ledger.clone(),
            audit: backends.audit.clone(),
            clock: clock.clone(),
            settings: EnvelopeSettings::from(&cfg.envelope),
        });
        let jobs = standard_schedule(
            &cfg.jobs,
            clock.clone(),
            [
                Arc::new(RefreshRateLimits::new(
                    limiter.clone(),
                    backends.pubsub.clone(),
                    cfg.watch.path.clone(),
                )),
                Arc::new(ExpireSubscriptions::new(plans.clone())),
                Arc::new(GcIdempotency::new(idempotency.clone())),
                Arc::new(ReconcileOrphans::new(idempotency.clone())),
                Arc::new(RenewalReminder::new(
                    plans.clone(),
                    backends.cache.clone(),
                    self.notifier,
                    clock.clone(),
                    cfg.jobs.reminder_days,
                )),
                Arc::new(PruneCaches::new(plans.clone(), ledger.clone(), backends.cache.clone())),
            ],
        )?;
        let bus = Arc::new(ConfigBus::new(cfg.clone()));

        Ok(MeteredCore {
            config: cfg,
            clock,
            backends,
            tariffs,
            plans,
            limiter,
            idempotency,
            ledger,
            envelope,
            bus,
            scheduler: Mutex::new(Some(jobs)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled metered core.
pub struct MeteredCore {
    config: MeterConfig,
    clock: Arc<dyn Clock>,
    backends: Backends,
    tariffs: Arc<TariffRegistry>,
    plans: Arc<PlanRegistry>,
    limiter: Arc<AdmissionLimiter>,
    idempotency: Arc<IdempotencyKeeper>,
    ledger: Arc<TokenLedger>,
    envelope: Envelope,
    bus: Arc<ConfigBus>,
    scheduler: Mutex<Option<crate::jobs::JobScheduler>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MeteredCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredCore").field("envelope", &self.envelope).finish_non_exhaustive()
    }
}

impl MeteredCore {
    pub fn builder(config: MeterConfig) -> MeteredCoreBuilder {
        MeteredCoreBuilder {
            config,
            backends: None,
            clock: Arc::new(SystemClock),
            identity: Arc::new(TrustedIdentity),
            notifier: Arc::new(TracingNotifier),
        }
    }

    /// Build from a TOML file; the file is also watched once started.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<MeteredCoreBuilder, ConfigError> {
        let path = path.into();
        let mut config = MeterConfig::load(&path)?;
        config.watch.path = Some(path);
        Ok(Self::builder(config))
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn tariffs(&self) -> &Arc<TariffRegistry> {
        &self.tariffs
    }

    pub fn plans(&self) -> &Arc<PlanRegistry> {
        &self.plans
    }

    pub fn limiter(&self) -> &Arc<AdmissionLimiter> {
        &self.limiter
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyKeeper> {
        &self.idempotency
    }

    pub fn ledger(&self) -> &Arc<TokenLedger> {
        &self.ledger
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn bus(&self) -> &Arc<ConfigBus> {
        &self.bus
    }

    /// Load tariffs, wire the bus and start the scheduler. Calling it a
    /// second time is a no-op.
    pub async fn start(&self) -> Result<(), MeterError> {
        let Some(scheduler) = self.scheduler.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return Ok(());
        };
        if let Err(e) = self.tariffs.reload().await {
            warn!(
                target: "metered::app",
                error = %e,
                "initial tariff load failed; serving defaults"
            );
        }
        self.bus.register(self.tariffs.clone());
        self.bus.register(self.plans.clone());
        self.bus.register(self.limiter.clone());
        self.bus.attach_pubsub(self.backends.pubsub.clone()).await?;
        if let Some(path) = &self.config.watch.path {
            self.bus.watch_file(
                path.clone(),
                Duration::from_millis(self.config.watch.debounce_ms),
                Duration::from_millis(self.config.watch.poll_interval_ms),
            );
        }
        let handle = scheduler.start(self.cancel.child_token());
        self.handles.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
        info!(target: "metered::app", "metered core started");
        Ok(())
    }

    /// Stop background work and wait for it.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.bus.shutdown().await;
        let handles: Vec<_> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(target: "metered::app", error = %e, "background task ended abnormally");
            }
        }
        info!(target: "metered::app", "metered core stopped");
    }
}
