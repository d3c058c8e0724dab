//! Maintenance jobs and their cron scheduler.
//!
//! Jobs sit in a min-heap keyed by next fire time. The scheduler loop pops
//! whatever is due, runs each on its own task (skipping a job whose
//! previous run has not finished) and pushes it back with its next time.

use crate::cache::SharedCache;
use crate::clock::Clock;
use crate::config::{parse_schedule, ConfigError, JobsConfig, MeterConfig};
use crate::error::{MeterError, StoreError};
use crate::idempotency::IdempotencyKeeper;
use crate::ledger::TokenLedger;
use crate::model::Subscription;
use crate::plan::PlanRegistry;
use crate::pubsub::{PubSub, RATELIMIT_PLANS_UPDATE};
use crate::rate_limit::AdmissionLimiter;
use async_trait::async_trait;
use chrono::DateTime;
use cron::Schedule;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest the loop sleeps before re-reading the clock.
const MAX_IDLE: Duration = Duration::from_secs(1);

/// A periodic maintenance task. Returns how many items it touched.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<u64, MeterError>;
}

struct Entry {
    job: Arc<dyn Job>,
    schedule: Schedule,
    running: Arc<AtomicBool>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at_ms: u64,
    index: usize,
}

pub struct JobScheduler {
    entries: Vec<Entry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler").field("jobs", &self.names()).finish()
    }
}

fn next_fire(schedule: &Schedule, after_ms: u64) -> Option<u64> {
    let after = DateTime::from_timestamp_millis(i64::try_from(after_ms).ok()?)?;
    let next = schedule.after(&after).next()?;
    u64::try_from(next.timestamp_millis()).ok()
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Vec::new(), clock }
    }

    pub fn add(&mut self, job: Arc<dyn Job>, schedule: Schedule) -> &mut Self {
        self.entries.push(Entry { job, schedule, running: Arc::new(AtomicBool::new(false)) });
        self
    }

    /// Add `job` under the cron expression `expr`.
    pub fn add_cron(&mut self, job: Arc<dyn Job>, expr: &str) -> Result<&mut Self, ConfigError> {
        let schedule = parse_schedule(expr)?;
        Ok(self.add(job, schedule))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.job.name()).collect()
    }

    /// Run `name` immediately on the calling task.
    pub async fn run_now(&self, name: &str) -> Option<Result<u64, MeterError>> {
        let entry = self.entries.iter().find(|e| e.job.name() == name)?;
        Some(entry.job.run().await)
    }

    fn initial_heap(&self, now_ms: u64) -> BinaryHeap<Reverse<Due>> {
        let mut heap = BinaryHeap::new();
        for (index, entry) in self.entries.iter().enumerate() {
            match next_fire(&entry.schedule, now_ms) {
                Some(at_ms) => heap.push(Reverse(Due { at_ms, index })),
                None => warn!(
                    target: "metered::jobs",
                    job = entry.job.name(),
                    "schedule never fires; job disabled"
                ),
            }
        }
        heap
    }

    /// Launch every job due at `now_ms` and reschedule it. Returns the
    /// names launched.
    fn launch_due(&self, heap: &mut BinaryHeap<Reverse<Due>>, now_ms: u64) -> Vec<&'static str> {
        let mut launched = Vec::new();
        while heap.peek().is_some_and(|Reverse(d)| d.at_ms <= now_ms) {
            let Some(Reverse(due)) = heap.pop() else { break };
            let Some(entry) = self.entries.get(due.index) else { continue };
            let name = entry.job.name();
            if entry.running.swap(true, Ordering::AcqRel) {
                warn!(
                    target: "metered::jobs",
                    job = name,
                    "previous run still in progress; skipping"
                );
            } else {
                let job = entry.job.clone();
                let running = entry.running.clone();
                tokio::spawn(async move {
                    let started = tokio::time::Instant::now();
                    match job.run().await {
                        Ok(affected) => {
                            info!(
                                target: "metered::jobs",
                                job = name,
                                affected,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "job finished"
                            );
                        }
                        Err(e) => error!(
                            target: "metered::jobs",
                            job = name,
                            error = %e,
                            "job failed"
                        ),
                    }
                    running.store(false, Ordering::Release);
                });
                launched.push(name);
            }
            if let Some(at_ms) = next_fire(&entry.schedule, now_ms) {
                heap.push(Reverse(Due { at_ms, index: due.index }));
            }
        }
        launched
    }

    /// Drive the schedule until `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut heap = self.initial_heap(self.clock.now_millis());
            info!(target: "metered::jobs", jobs = ?self.names(), "scheduler started");
            loop {
                let now = self.clock.now_millis();
                let launched = self.launch_due(&mut heap, now);
                if !launched.is_empty() {
                    debug!(target: "metered::jobs", ?launched, "jobs launched");
                }
                let wait = heap
                    .peek()
                    .map_or(MAX_IDLE, |Reverse(d)| {
                        Duration::from_millis(d.at_ms.saturating_sub(now))
                    })
                    .min(MAX_IDLE);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!(target: "metered::jobs", "scheduler stopped");
        })
    }
}

/// Reload rate-limit plans from the config file (when one is set), publish
/// the table for other replicas and drop idle local buckets.
pub struct RefreshRateLimits {
    limiter: Arc<AdmissionLimiter>,
    pubsub: Arc<dyn PubSub>,
    source: Option<PathBuf>,
    idle_horizon: Duration,
}

impl RefreshRateLimits {
    pub fn new(
        limiter: Arc<AdmissionLimiter>,
        pubsub: Arc<dyn PubSub>,
        source: Option<PathBuf>,
    ) -> Self {
        Self { limiter, pubsub, source, idle_horizon: Duration::from_secs(600) }
    }

    pub fn with_idle_horizon(mut self, horizon: Duration) -> Self {
        self.idle_horizon = horizon;
        self
    }
}

#[async_trait]
impl Job for RefreshRateLimits {
    fn name(&self) -> &'static str {
        "refresh_rate_limits"
    }

    async fn run(&self) -> Result<u64, MeterError> {
        if let Some(path) = &self.source {
            self.reload_source(path).await?;
        }
        let update = self.limiter.plans_update();
        if update.version == 0 {
            debug!(target: "metered::jobs", "no versioned plan table to publish");
        } else {
            let payload = serde_json::to_string(&update)
                .map_err(|e| MeterError::Internal(format!("encode plans update: {e}")))?;
            if let Err(e) = self.pubsub.publish(RATELIMIT_PLANS_UPDATE, &payload).await {
                warn!(target: "metered::jobs", error = %e, "plans update publish failed");
            }
        }
        Ok(self.limiter.evict_idle(self.idle_horizon) as u64)
    }
}

impl RefreshRateLimits {
    /// Re-apply the file under its modification time, so a file older than
    /// the table already in force loses to it.
    async fn reload_source(&self, path: &Path) -> Result<(), MeterError> {
        let read_err =
            |e: std::io::Error| MeterError::Internal(format!("read {}: {e}", path.display()));
        let modified =
            tokio::fs::metadata(path).await.map_err(read_err)?.modified().map_err(read_err)?;
        let version = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let raw = tokio::fs::read_to_string(path).await.map_err(read_err)?;
        match MeterConfig::from_toml(&raw) {
            Ok(cfg) => {
                if !self.limiter.apply_config(&cfg.rate_limit, version) {
                    debug!(
                        target: "metered::jobs",
                        version,
                        current = self.limiter.policy_version(),
                        "rate limit source not newer than applied plans"
                    );
                }
            }
            Err(e) => warn!(
                target: "metered::jobs",
                error = %e,
                "rate limit source invalid; keeping current plans"
            ),
        }
        Ok(())
    }
}

/// Move lapsed subscriptions to `EXPIRED`.
pub struct ExpireSubscriptions {
    plans: Arc<PlanRegistry>,
}

impl ExpireSubscriptions {
    pub fn new(plans: Arc<PlanRegistry>) -> Self {
        Self { plans }
    }
}

#[async_trait]
impl Job for ExpireSubscriptions {
    fn name(&self) -> &'static str {
        "expire_subscriptions"
    }

    async fn run(&self) -> Result<u64, MeterError> {
        Ok(self.plans.expire_subscriptions().await?.len() as u64)
    }
}

/// Delete idempotency rows past retention.
pub struct GcIdempotency {
    keeper: Arc<IdempotencyKeeper>,
}

impl GcIdempotency {
    pub fn new(keeper: Arc<IdempotencyKeeper>) -> Self {
        Self { keeper }
    }
}

#[async_trait]
impl Job for GcIdempotency {
    fn name(&self) -> &'static str {
        "gc_idempotency"
    }

    async fn run(&self) -> Result<u64, MeterError> {
        self.keeper.gc_expired().await
    }
}

/// Fail `PENDING` rows older than the in-flight lock.
pub struct ReconcileOrphans {
    keeper: Arc<IdempotencyKeeper>,
    older_than: Duration,
}

impl ReconcileOrphans {
    pub fn new(keeper: Arc<IdempotencyKeeper>) -> Self {
        let older_than = keeper.lock_ttl();
        Self { keeper, older_than }
    }
}

#[async_trait]
impl Job for ReconcileOrphans {
    fn name(&self) -> &'static str {
        "reconcile_orphans"
    }

    async fn run(&self) -> Result<u64, MeterError> {
        Ok(self.keeper.reconcile_orphans(self.older_than).await? as u64)
    }
}

/// Delivers renewal reminders.
#[async_trait]
pub trait ReminderNotifier: Send + Sync {
    async fn notify(&self, subscription: &Subscription) -> Result<(), StoreError>;
}

/// Logs reminders instead of sending them.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl ReminderNotifier for TracingNotifier {
    async fn notify(&self, sub: &Subscription) -> Result<(), StoreError> {
        info!(
            target: "metered::jobs",
            user = %sub.user_id,
            subscription = sub.id,
            ended_at = %sub.ended_at,
            "renewal reminder"
        );
        Ok(())
    }
}

/// Remind users whose subscription ends within `days`, at most once per
/// subscription per day.
pub struct RenewalReminder {
    plans: Arc<PlanRegistry>,
    cache: Arc<dyn SharedCache>,
    notifier: Arc<dyn ReminderNotifier>,
    clock: Arc<dyn Clock>,
    days: u32,
}

impl RenewalReminder {
    pub fn new(
        plans: Arc<PlanRegistry>,
        cache: Arc<dyn SharedCache>,
        notifier: Arc<dyn ReminderNotifier>,
        clock: Arc<dyn Clock>,
        days: u32,
    ) -> Self {
        Self { plans, cache, notifier, clock, days }
    }
}

#[async_trait]
impl Job for RenewalReminder {
    fn name(&self) -> &'static str {
        "reminder"
    }

    async fn run(&self) -> Result<u64, MeterError> {
        let today = self.clock.now().format("%Y-%m-%d").to_string();
        let mut sent = 0;
        for sub in self.plans.ending_within(self.days).await? {
            let key = format!("reminder:{today}:{}", sub.id);
            if !self.cache.set_if_absent(&key, Duration::from_secs(48 * 3_600)).await? {
                continue;
            }
            match self.notifier.notify(&sub).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(
                        target: "metered::jobs",
                        subscription = sub.id,
                        error = %e,
                        "reminder failed; will retry"
                    );
                    if let Err(e) = self.cache.remove(&key).await {
                        warn!(
                            target: "metered::jobs",
                            key = %key,
                            error = %e,
                            "failed to clear reminder marker"
                        );
                    }
                }
            }
        }
        Ok(sent)
    }
}

/// Drop expired entries from the in-process caches.
pub struct PruneCaches {
    plans: Arc<PlanRegistry>,
    ledger: Arc<TokenLedger>,
    cache: Arc<dyn SharedCache>,
}

impl PruneCaches {
    pub fn new(
        plans: Arc<PlanRegistry>,
        ledger: Arc<TokenLedger>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        Self { plans, ledger, cache }
    }
}

#[async_trait]
impl Job for PruneCaches {
    fn name(&self) -> &'static str {
        "prune_caches"
    }

    async fn run(&self) -> Result<u64, MeterError> {
        let plans = self.plans.purge_expired();
        let balances = self.ledger.purge_expired();
        let keys = self.cache.purge_expired();
        debug!(target: "metered::jobs", plans, balances, keys, "caches pruned");
        Ok((plans + balances + keys) as u64)
    }
}

/// Build the standard schedule from `config`.
pub fn standard_schedule(
    config: &JobsConfig,
    clock: Arc<dyn Clock>,
    jobs: [Arc<dyn Job>; 6],
) -> Result<JobScheduler, ConfigError> {
    let mut scheduler = JobScheduler::new(clock);
    for job in jobs {
        let expr = config
            .schedules()
            .into_iter()
            .find(|(name, _)| *name == job.name())
            .map(|(_, expr)| expr)
            .ok_or_else(|| ConfigError::Invalid(format!("no schedule for job {}", job.name())))?;
        scheduler.add_cron(job, expr)?;
    }
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::clock::ManualClock;
    use crate::config::Quota;
    use crate::model::PlanName;
    use crate::pubsub::InMemoryPubSub;
    use crate::rate_limit::PlanPolicyUpdate;
    use crate::retry::{InstantSleeper, RetryPolicy};
    use crate::store::MemoryStore;
    use crate::tariff::TariffRegistry;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    struct Counting {
        name: &'static str,
        runs: AtomicU64,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self) -> Result<u64, MeterError> {
            Ok(self.runs.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[test]
    fn next_fire_follows_cron() {
        let every_minute = parse_schedule("0 * * * * *").unwrap();
        let at = 1_700_000_000_000;
        let next = next_fire(&every_minute, at).unwrap();
        assert!(next > at);
        assert_eq!(next % 60_000, 0);
        assert!(next - at <= 60_000);
    }

    #[tokio::test]
    async fn launches_only_due_jobs_and_reschedules() {
        let clock = ManualClock::default();
        let mut s = JobScheduler::new(Arc::new(clock.clone()));
        let minutely = Arc::new(Counting { name: "minutely", runs: AtomicU64::new(0) });
        let hourly = Arc::new(Counting { name: "hourly", runs: AtomicU64::new(0) });
        s.add_cron(minutely.clone(), "0 * * * * *").unwrap();
        s.add_cron(hourly.clone(), "0 0 * * * *").unwrap();

        let now = clock.now_millis();
        let mut heap = s.initial_heap(now);
        assert!(s.launch_due(&mut heap, now).is_empty());
        let launched = s.launch_due(&mut heap, now + 61_000);
        assert_eq!(launched, vec!["minutely"]);
        assert_eq!(heap.len(), 2);
        let launched = s.launch_due(&mut heap, now + 3_601_000);
        assert!(launched.contains(&"hourly"));
    }

    #[tokio::test]
    async fn run_now_finds_job_by_name() {
        let mut s = JobScheduler::new(Arc::new(ManualClock::default()));
        let gc = Arc::new(Counting { name: "gc", runs: AtomicU64::new(0) });
        s.add_cron(gc, "0 0 * * * *").unwrap();
        assert_eq!(s.run_now("gc").await.unwrap().unwrap(), 1);
        assert!(s.run_now("missing").await.is_none());
        let bad = Arc::new(Counting { name: "bad", runs: AtomicU64::new(0) });
        assert!(s.add_cron(bad, "nope").is_err());
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<i64>>);

    #[async_trait]
    impl ReminderNotifier for Collect {
        async fn notify(&self, sub: &Subscription) -> Result<(), StoreError> {
            self.0.lock().unwrap().push(sub.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn reminders_are_sent_once_per_day() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let pubsub = Arc::new(InMemoryPubSub::new());
        let plans = Arc::new(PlanRegistry::new(
            store.clone(),
            pubsub,
            Arc::new(clock.clone()),
            Duration::from_secs(30),
        ));
        let pro = store.add_plan("PRO", 2);
        store.seed_user("u1", 0);
        plans.assign(&"u1".into(), pro.id, 2).await.unwrap();

        let notifier = Arc::new(Collect::default());
        let job = RenewalReminder::new(
            plans,
            Arc::new(InMemoryCache::new(Arc::new(clock.clone()))),
            notifier.clone(),
            Arc::new(clock.clone()),
            3,
        );
        assert_eq!(job.run().await.unwrap(), 1);
        assert_eq!(job.run().await.unwrap(), 0);
        clock.advance(Duration::from_secs(86_400));
        assert_eq!(job.run().await.unwrap(), 1);
        assert_eq!(notifier.0.lock().unwrap().len(), 2);
    }

    fn limiter(clock: &ManualClock) -> Arc<AdmissionLimiter> {
        Arc::new(AdmissionLimiter::new(&Default::default(), None, Arc::new(clock.clone())))
    }

    #[tokio::test]
    async fn refresh_publishes_plan_table() {
        let clock = ManualClock::default();
        let pubsub = Arc::new(InMemoryPubSub::new());
        let mut rx = pubsub.subscribe(RATELIMIT_PLANS_UPDATE).await.unwrap();
        let limiter = limiter(&clock);
        assert!(limiter.apply_config(&Default::default(), 5));
        let job = RefreshRateLimits::new(limiter, pubsub.clone(), None);
        job.run().await.unwrap();
        let payload = futures::StreamExt::next(&mut rx).await.unwrap();
        let update: PlanPolicyUpdate = serde_json::from_str(&payload).unwrap();
        assert_eq!(update.version, 5);
        assert!(update.plans.contains_key("FREE"));
    }

    #[tokio::test]
    async fn refresh_without_an_applied_table_publishes_nothing() {
        let clock = ManualClock::default();
        let pubsub = Arc::new(InMemoryPubSub::new());
        let mut rx = pubsub.subscribe(RATELIMIT_PLANS_UPDATE).await.unwrap();
        let job = RefreshRateLimits::new(limiter(&clock), pubsub.clone(), None);
        job.run().await.unwrap();
        let next =
            tokio::time::timeout(Duration::from_millis(50), futures::StreamExt::next(&mut rx));
        assert!(next.await.is_err());
    }

    #[tokio::test]
    async fn refresh_on_a_fresh_replica_does_not_revert_newer_plans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.toml");
        std::fs::write(&path, "[rate_limit.plans.FREE]\nrps = 1.0\nburst = 1\n").unwrap();
        let written = std::fs::metadata(&path).unwrap().modified().unwrap();
        let written_ms = written.duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;

        let clock = ManualClock::default();
        let pubsub = Arc::new(InMemoryPubSub::new());
        let mut rx = pubsub.subscribe(RATELIMIT_PLANS_UPDATE).await.unwrap();

        // Replica A took an operator change after the file was written.
        let a = limiter(&clock);
        let mut operator = a.plans_update();
        operator.version = written_ms + 60_000;
        operator.plans.insert("FREE".into(), Quota::new(3.0, 42));
        assert!(a.update_plans(&operator));

        // Replica B boots from the file and runs its refresh.
        let b = limiter(&clock);
        let job = RefreshRateLimits::new(b.clone(), pubsub.clone(), Some(path));
        job.run().await.unwrap();
        assert_eq!(b.policy_version(), written_ms);

        let payload = futures::StreamExt::next(&mut rx).await.unwrap();
        let published: PlanPolicyUpdate = serde_json::from_str(&payload).unwrap();
        assert_eq!(published.version, written_ms);
        assert!(!a.update_plans(&published));
        let (_, free) = a.policy().plan_quota(&PlanName::free()).unwrap();
        assert_eq!(free, Quota::new(3.0, 42));

        // Once B holds A's table, its older file no longer overrides it.
        assert!(b.update_plans(&a.plans_update()));
        job.run().await.unwrap();
        let (_, free) = b.policy().plan_quota(&PlanName::free()).unwrap();
        assert_eq!(free.burst, 42);
    }

    #[tokio::test]
    async fn prune_caches_drops_expired_entries() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let pubsub = Arc::new(InMemoryPubSub::new());
        let plans = Arc::new(PlanRegistry::new(
            store.clone(),
            pubsub.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(30),
        ));
        let tariffs = Arc::new(TariffRegistry::new(
            store.clone(),
            pubsub,
            Arc::new(clock.clone()),
            Duration::from_secs(300),
        ));
        let ledger = Arc::new(TokenLedger::new(
            store.clone(),
            tariffs,
            Arc::new(clock.clone()),
            RetryPolicy::default().with_sleeper(Arc::new(InstantSleeper)),
            Duration::from_secs(1),
        ));
        let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
        store.seed_user("u1", 10);
        plans.plan(&"u1".into()).await;
        ledger.balance(&"u1".into()).await.unwrap();
        cache.set_if_absent("lock", Duration::from_secs(5)).await.unwrap();

        let job = PruneCaches::new(plans, ledger, cache.clone());
        assert_eq!(job.run().await.unwrap(), 0);
        clock.advance(Duration::from_secs(60));
        assert_eq!(job.run().await.unwrap(), 3);
        assert!(!cache.contains("lock"));
    }

    #[test]
    fn standard_schedule_rejects_unknown_job() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let job = |name: &'static str| -> Arc<dyn Job> {
            Arc::new(Counting { name, runs: AtomicU64::new(0) })
        };
        let ok = standard_schedule(
            &JobsConfig::default(),
            clock.clone(),
            [
                job("refresh_rate_limits"),
                job("expire_subscriptions"),
                job("gc_idempotency"),
                job("reconcile_orphans"),
                job("reminder"),
                job("prune_caches"),
            ],
        )
        .unwrap();
        assert_eq!(ok.names().len(), 6);
        let err = standard_schedule(
            &JobsConfig::default(),
            clock,
            [
                job("refresh_rate_limits"),
                job("expire_subscriptions"),
                job("gc_idempotency"),
                job("reconcile_orphans"),
                job("reminder"),
                job("other"),
            ],
        );
        assert!(err.is_err());
    }
}
