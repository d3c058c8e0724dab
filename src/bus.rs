//! Config hot-reload bus.
//!
//! Sources (the config file watcher and the three pub/sub channels) turn
//! into [`ConfigEvent`]s that fan out to registered listeners. Every
//! listener has its own bounded queue and task, so a slow listener drops
//! its own events instead of blocking the others or the request path.

use crate::config::{ConfigError, MeterConfig};
use crate::error::StoreError;
use crate::model::UserId;
use crate::pubsub::{
    PubSub, ALL_CHANNELS, RATELIMIT_PLANS_UPDATE, TOKEN_RULES_UPDATE, USER_PLAN_INVALIDATE,
};
use crate::rate_limit::PlanPolicyUpdate;
use crate::retry::Backoff;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, SelectAll};
use futures::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue depth per listener.
pub const LISTENER_QUEUE: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum ConfigEvent {
    /// `token:rules:update`: tariff overrides changed.
    TariffRulesChanged,
    /// `ratelimit:plans:update`.
    PlanPoliciesChanged(PlanPolicyUpdate),
    /// `user:plan:invalidate`; `None` drops every cached plan.
    UserPlanInvalidated(Option<UserId>),
    /// The watched config file was rewritten and parsed.
    FileChanged(Arc<MeterConfig>),
}

impl ConfigEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigEvent::TariffRulesChanged => "tariff_rules_changed",
            ConfigEvent::PlanPoliciesChanged(_) => "plan_policies_changed",
            ConfigEvent::UserPlanInvalidated(_) => "user_plan_invalidated",
            ConfigEvent::FileChanged(_) => "file_changed",
        }
    }

    /// Decode a pub/sub message. Unknown channels and malformed payloads
    /// yield `None`.
    pub fn from_message(channel: &str, payload: &str) -> Option<Self> {
        match channel {
            TOKEN_RULES_UPDATE => Some(ConfigEvent::TariffRulesChanged),
            RATELIMIT_PLANS_UPDATE => {
                let decoded = serde_json::from_str::<PlanPolicyUpdate>(payload)
                    .map_err(|e| e.to_string())
                    .and_then(|u| u.validate().map(|()| u).map_err(|e| e.to_string()));
                match decoded {
                    Ok(update) => Some(ConfigEvent::PlanPoliciesChanged(update)),
                    Err(error) => {
                        warn!(
                            target: "metered::bus",
                            channel,
                            %error,
                            "unusable plans update ignored"
                        );
                        None
                    }
                }
            }
            USER_PLAN_INVALIDATE => {
                let user = payload.trim();
                if user.is_empty() || user == "*" {
                    Some(ConfigEvent::UserPlanInvalidated(None))
                } else {
                    Some(ConfigEvent::UserPlanInvalidated(Some(UserId::new(user))))
                }
            }
            _ => None,
        }
    }
}

/// Something that reacts to config changes.
#[async_trait]
pub trait ConfigListener: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_event(&self, event: &ConfigEvent);
}

struct Registered {
    name: &'static str,
    tx: mpsc::Sender<Arc<ConfigEvent>>,
}

struct Shared {
    listeners: RwLock<Vec<Registered>>,
    current: Snapshot<MeterConfig>,
}

impl Shared {
    fn dispatch(&self, event: ConfigEvent) -> usize {
        let event = Arc::new(event);
        let listeners = self.listeners.read().unwrap_or_else(|p| p.into_inner());
        let mut delivered = 0;
        for l in listeners.iter() {
            match l.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        target: "metered::bus",
                        listener = l.name,
                        event = event.kind(),
                        "listener queue full; event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(target: "metered::bus", listener = l.name, "listener stopped");
                }
            }
        }
        delivered
    }

    async fn reload_file(&self, path: &Path) -> Result<bool, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let next = MeterConfig::from_toml(&raw)?;
        if *self.current.load() == next {
            return Ok(false);
        }
        self.current.store(next.clone());
        info!(target: "metered::bus", path = %path.display(), "config file reloaded");
        self.dispatch(ConfigEvent::FileChanged(Arc::new(next)));
        Ok(true)
    }
}

/// Fans config events out to listeners.
pub struct ConfigBus {
    shared: Arc<Shared>,
    resubscribe: Backoff,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConfigBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigBus")
            .field("listeners", &self.listener_names())
            .finish_non_exhaustive()
    }
}

type Fingerprint = Option<(SystemTime, u64)>;

type Messages = SelectAll<BoxStream<'static, (&'static str, String)>>;

async fn subscribe_all(pubsub: &dyn PubSub) -> Result<Messages, StoreError> {
    let mut streams = Vec::with_capacity(ALL_CHANNELS.len());
    for channel in ALL_CHANNELS {
        let messages = pubsub.subscribe(channel).await?;
        streams.push(messages.map(move |payload| (channel, payload)).boxed());
    }
    Ok(stream::select_all(streams))
}

async fn fingerprint(path: &Path) -> Fingerprint {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

impl ConfigBus {
    pub fn new(initial: MeterConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: RwLock::new(Vec::new()),
                current: Snapshot::new(initial),
            }),
            resubscribe: Backoff::exponential(Duration::from_millis(100), Duration::from_secs(30)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Delay schedule for resubscribing after the pub/sub streams end.
    pub fn with_resubscribe_backoff(mut self, backoff: Backoff) -> Self {
        self.resubscribe = backoff;
        self
    }

    /// Config most recently loaded.
    pub fn current(&self) -> Arc<MeterConfig> {
        self.shared.current.load()
    }

    pub fn listener_names(&self) -> Vec<&'static str> {
        let listeners = self.shared.listeners.read().unwrap_or_else(|p| p.into_inner());
        listeners.iter().map(|l| l.name).collect()
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
    }

    /// Register `listener` and start its task. Must run inside a tokio
    /// runtime.
    pub fn register(&self, listener: Arc<dyn ConfigListener>) {
        let (tx, mut rx) = mpsc::channel::<Arc<ConfigEvent>>(LISTENER_QUEUE);
        let name = listener.name();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let handled = AssertUnwindSafe(listener.on_event(&event)).catch_unwind().await;
                if handled.is_err() {
                    error!(
                        target: "metered::bus",
                        listener = name,
                        event = event.kind(),
                        "listener panicked"
                    );
                }
            }
            debug!(target: "metered::bus", listener = name, "listener task stopped");
        });
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Registered { name, tx });
        self.track(handle);
    }

    /// Queue `event` for every listener; returns how many accepted it.
    pub fn dispatch(&self, event: ConfigEvent) -> usize {
        self.shared.dispatch(event)
    }

    /// Re-read `path` now. Returns whether the config changed. A parse
    /// failure leaves the current config in place.
    pub async fn reload_file(&self, path: impl AsRef<Path>) -> Result<bool, ConfigError> {
        self.shared.reload_file(path.as_ref()).await
    }

    /// Subscribe to the change channels and forward their messages.
    ///
    /// The first subscription failure is returned. Afterwards, when the
    /// merged stream ends the task resubscribes with backoff and then asks
    /// listeners to resync, since messages may have been missed meanwhile.
    pub async fn attach_pubsub(&self, pubsub: Arc<dyn PubSub>) -> Result<(), StoreError> {
        let mut merged = subscribe_all(pubsub.as_ref()).await?;
        let shared = self.shared.clone();
        let cancel = self.cancel.child_token();
        let backoff = self.resubscribe;
        let handle = tokio::spawn(async move {
            let mut attempt = 0usize;
            loop {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = merged.next() => next,
                    };
                    let Some((channel, payload)) = next else { break };
                    attempt = 0;
                    if let Some(event) = ConfigEvent::from_message(channel, &payload) {
                        debug!(target: "metered::bus", channel, event = event.kind(), "received");
                        shared.dispatch(event);
                    }
                }
                warn!(target: "metered::bus", "pub/sub streams ended; resubscribing");
                merged = loop {
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff.delay(attempt)) => {}
                    }
                    match subscribe_all(pubsub.as_ref()).await {
                        Ok(streams) => break streams,
                        Err(e) => {
                            warn!(target: "metered::bus", attempt, error = %e, "resubscribe failed")
                        }
                    }
                };
                info!(target: "metered::bus", attempt, "resubscribed to change channels");
                shared.dispatch(ConfigEvent::TariffRulesChanged);
                shared.dispatch(ConfigEvent::UserPlanInvalidated(None));
            }
        });
        self.track(handle);
        info!(target: "metered::bus", channels = ?ALL_CHANNELS, "subscribed to change channels");
        Ok(())
    }

    /// Poll `path` every `poll`; reload once it has been stable for
    /// `debounce`.
    pub fn watch_file(&self, path: impl Into<PathBuf>, debounce: Duration, poll: Duration) {
        let path = path.into();
        let shared = self.shared.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let mut last_seen = fingerprint(&path).await;
            let mut changed_at: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
                let seen = fingerprint(&path).await;
                if seen != last_seen {
                    last_seen = seen;
                    changed_at = Some(Instant::now());
                    continue;
                }
                let Some(at) = changed_at else { continue };
                if at.elapsed() < debounce {
                    continue;
                }
                changed_at = None;
                if let Err(e) = shared.reload_file(&path).await {
                    warn!(
                        target: "metered::bus",
                        path = %path.display(),
                        error = %e,
                        "config reload failed; keeping previous config"
                    );
                }
            }
        });
        self.track(handle);
        info!(target: "metered::bus", ?debounce, ?poll, "watching config file");
    }

    /// Stop every task and wait for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(target: "metered::bus", error = %e, "bus task panicked");
                }
            }
        }
    }
}

impl Drop for ConfigBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
