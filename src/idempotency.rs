//! Idempotency keeper: at-most-once execution per `(user, endpoint, key)`.
//!
//! The durable row is the record of truth; a short-lived lock in the shared
//! cache coordinates requests that are still in flight. When the cache is
//! unreachable the keeper proceeds on the row alone.

use crate::cache::SharedCache;
use crate::clock::Clock;
use crate::error::MeterError;
use crate::model::{IdempotencyRecord, IdempotencyStatus, StoredResponse, UserId};
use crate::store::IdempotencyStore;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest accepted `Idempotency-Key`.
pub const MAX_KEY_LEN: usize = 128;

/// Validate a client key. Missing or empty keys mean "not idempotent".
pub fn normalize_key(raw: Option<&str>) -> Result<Option<String>, MeterError> {
    let Some(key) = raw.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    if key.len() > MAX_KEY_LEN {
        return Err(MeterError::ClientInput(format!(
            "Idempotency-Key longer than {MAX_KEY_LEN} characters"
        )));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(MeterError::ClientInput("Idempotency-Key must be printable ASCII".into()));
    }
    Ok(Some(key.to_string()))
}

/// Result of [`IdempotencyKeeper::begin`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeginOutcome {
    /// First sighting; the caller owns completion.
    Fresh,
    /// Another request with this key is still running.
    DuplicatePending,
    DuplicateDone(StoredResponse),
    DuplicateFailed(StoredResponse),
}

/// Final state recorded by [`IdempotencyKeeper::finish`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
}

impl From<Outcome> for IdempotencyStatus {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Done => IdempotencyStatus::Done,
            Outcome::Failed => IdempotencyStatus::Failed,
        }
    }
}

fn orphan_response() -> StoredResponse {
    StoredResponse {
        status: 500,
        body: serde_json::json!({ "code": 500, "message": "internal_error" }).to_string(),
    }
}

fn outcome_of(row: IdempotencyRecord) -> BeginOutcome {
    match row.status {
        IdempotencyStatus::Pending => BeginOutcome::DuplicatePending,
        IdempotencyStatus::Done => BeginOutcome::DuplicateDone(row.response.unwrap_or_else(|| {
            StoredResponse { status: 200, body: MeterError::IdempotentDuplicate.body().to_string() }
        })),
        IdempotencyStatus::Failed => {
            BeginOutcome::DuplicateFailed(row.response.unwrap_or_else(orphan_response))
        }
    }
}

pub struct IdempotencyKeeper {
    store: Arc<dyn IdempotencyStore>,
    cache: Arc<dyn SharedCache>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    lock_ttl: Duration,
}

impl std::fmt::Debug for IdempotencyKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyKeeper")
            .field("ttl", &self.ttl)
            .field("lock_ttl", &self.lock_ttl)
            .finish()
    }
}

impl IdempotencyKeeper {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        cache: Arc<dyn SharedCache>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self { store, cache, clock, ttl, lock_ttl }
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    fn lock_key(user: &UserId, endpoint: &str, key: &str) -> String {
        format!("idem:{user}:{endpoint}:{key}")
    }

    async fn release(&self, lock_key: &str) {
        if let Err(e) = self.cache.remove(lock_key).await {
            warn!(
                target: "metered::idempotency",
                lock = lock_key,
                error = %e,
                "failed to release in-flight lock"
            );
        }
    }

    pub async fn begin(
        &self,
        user: &UserId,
        endpoint: &str,
        key: &str,
    ) -> Result<BeginOutcome, MeterError> {
        let lock_key = Self::lock_key(user, endpoint, key);
        let locked = match self.cache.set_if_absent(&lock_key, self.lock_ttl).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    target: "metered::idempotency",
                    %user,
                    endpoint,
                    error = %e,
                    "cache lock unavailable; using durable row only"
                );
                None
            }
        };

        if locked == Some(false) {
            let outcome = match self.store.get(user, endpoint, key).await? {
                Some(row) => outcome_of(row),
                None => BeginOutcome::DuplicatePending,
            };
            debug!(
                target: "metered::idempotency",
                %user,
                endpoint,
                key,
                ?outcome,
                "in-flight lock held elsewhere"
            );
            return Ok(outcome);
        }

        let now = self.clock.now();
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::days(7));
        let record = IdempotencyRecord {
            user_id: user.clone(),
            endpoint: endpoint.to_string(),
            key: key.to_string(),
            status: IdempotencyStatus::Pending,
            response: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        };
        match self.store.insert_if_absent(record).await {
            Ok(None) => {
                debug!(target: "metered::idempotency", %user, endpoint, key, "fresh");
                Ok(BeginOutcome::Fresh)
            }
            Ok(Some(existing)) => {
                if locked == Some(true) {
                    self.release(&lock_key).await;
                }
                let outcome = outcome_of(existing);
                debug!(target: "metered::idempotency", %user, endpoint, key, ?outcome, "duplicate");
                Ok(outcome)
            }
            Err(e) => {
                if locked == Some(true) {
                    self.release(&lock_key).await;
                }
                Err(e.into())
            }
        }
    }

    /// Transition the pending row to `outcome` with `response`. Returns
    /// `false` if the row was no longer pending.
    pub async fn finish(
        &self,
        user: &UserId,
        endpoint: &str,
        key: &str,
        response: StoredResponse,
        outcome: Outcome,
    ) -> Result<bool, MeterError> {
        let status = response.status;
        let updated = self
            .store
            .complete(user, endpoint, key, outcome.into(), response, self.clock.now())
            .await?;
        self.release(&Self::lock_key(user, endpoint, key)).await;
        if updated {
            debug!(
                target: "metered::idempotency",
                %user,
                endpoint,
                key,
                ?outcome,
                status,
                "finished"
            );
        } else {
            warn!(
                target: "metered::idempotency",
                %user,
                endpoint,
                key,
                ?outcome,
                "row was not pending at finish"
            );
        }
        Ok(updated)
    }

    /// Delete rows created more than `older_than` ago.
    pub async fn gc(&self, older_than: Duration) -> Result<u64, MeterError> {
        let age = ChronoDuration::from_std(older_than)
            .map_err(|_| MeterError::ClientInput("gc horizon out of range".into()))?;
        let removed = self.store.delete_created_before(self.clock.now() - age).await?;
        info!(target: "metered::idempotency", removed, "idempotency rows collected");
        Ok(removed)
    }

    /// [`gc`](Self::gc) with the configured retention.
    pub async fn gc_expired(&self) -> Result<u64, MeterError> {
        self.gc(self.ttl).await
    }

    /// Fail rows left `PENDING` for longer than `older_than` (their owner
    /// died before finishing) so duplicates stop waiting on them.
    pub async fn reconcile_orphans(&self, older_than: Duration) -> Result<usize, MeterError> {
        let age = ChronoDuration::from_std(older_than)
            .map_err(|_| MeterError::ClientInput("orphan horizon out of range".into()))?;
        let orphans = self.store.pending_created_before(self.clock.now() - age).await?;
        let mut fixed = 0;
        for row in orphans {
            error!(
                target: "metered::idempotency",
                user = %row.user_id,
                endpoint = %row.endpoint,
                key = %row.key,
                created_at = %row.created_at,
                "orphaned pending row; marking failed"
            );
            let (user, endpoint, key) = (&row.user_id, &row.endpoint, &row.key);
            if self.finish(user, endpoint, key, orphan_response(), Outcome::Failed).await? {
                fixed += 1;
            }
        }
        Ok(fixed)
    }
}
