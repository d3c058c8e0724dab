//! Datastore seams, one trait per owning component.
//!
//! The core assumes a single primary datastore. Each trait groups the rows a
//! component exclusively writes; implementations must make every method
//! atomic with respect to the rows it touches.
//!
//! - [`RuleStore`]: tariff rules (tariff registry).
//! - [`SubscriptionStore`]: plans and subscriptions (plan registry).
//! - [`LedgerStore`]: user balances and the ledger (token ledger).
//! - [`IdempotencyStore`]: idempotency rows (idempotency keeper).
//!
//! [`memory::MemoryStore`] implements all of them plus the audit sink.

pub mod memory;

use crate::error::StoreError;
use crate::model::{
    IdempotencyRecord, IdempotencyStatus, NewTariffRule, Plan, PlanId, StoredResponse,
    Subscription, SubscriptionId, TariffRule, TokenTransaction, TransactionType, User, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

pub use memory::{FaultTarget, MemoryStore};

/// Tariff rule rows.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rows with `is_active = 1`.
    async fn active_rules(&self) -> Result<Vec<TariffRule>, StoreError>;
    /// Every row, active or not.
    async fn all_rules(&self) -> Result<Vec<TariffRule>, StoreError>;
    /// Insert or update by `(service, action)`; the row becomes active.
    async fn upsert_rule(&self, rule: NewTariffRule) -> Result<TariffRule, StoreError>;
    /// Flip `is_active` on a row.
    async fn set_rule_active(&self, id: i64, active: bool) -> Result<TariffRule, StoreError>;
}

/// Plans and subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn plan(&self, id: PlanId) -> Result<Option<Plan>, StoreError>;
    /// Latest `ACTIVE` subscription joined with its plan.
    async fn active_subscription(
        &self,
        user: &UserId,
    ) -> Result<Option<(Subscription, Plan)>, StoreError>;
    async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError>;
    /// In one transaction: cancel every `ACTIVE` row of `user`, then insert
    /// the new `ACTIVE` row.
    async fn assign(
        &self,
        user: &UserId,
        plan_id: PlanId,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;
    /// `ACTIVE -> CANCELLED`. Terminal rows are rejected with `Invalid`.
    async fn cancel(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;
    /// Move `ended_at` of an `ACTIVE` row.
    async fn extend(
        &self,
        id: SubscriptionId,
        ended_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;
    /// Point an `ACTIVE` row at another plan.
    async fn change_plan(
        &self,
        id: SubscriptionId,
        plan_id: PlanId,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;
    /// `UPDATE ... SET status='EXPIRED' WHERE status='ACTIVE' AND ended_at < now`;
    /// returns the moved rows.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError>;
    /// `ACTIVE` rows with `from <= ended_at < to`.
    async fn ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError>;
}

/// One balance mutation plus its ledger row.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerEntry {
    pub user_id: UserId,
    /// Negative debits, positive credits.
    pub amount: i64,
    pub kind: TransactionType,
    pub service: String,
    pub action: String,
    pub ref_id: String,
    pub details: JsonValue,
}

/// Result of [`LedgerStore::apply`].
#[derive(Clone, Debug, PartialEq)]
pub enum LedgerOutcome {
    /// Balance updated and row inserted.
    Applied { transaction: TokenTransaction, balance: i64 },
    /// The conditional debit matched zero rows.
    Insufficient { balance: i64 },
}

/// Users and the append-only ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn user(&self, id: &UserId) -> Result<Option<User>, StoreError>;
    /// In one transaction: `UPDATE users SET balance = balance + amount`
    /// (guarded by `balance >= -amount` for debits) and insert the row.
    /// Unknown users are `NotFound`.
    async fn apply(&self, entry: LedgerEntry) -> Result<LedgerOutcome, StoreError>;
    /// Ledger rows of `user` in insertion order.
    async fn transactions(&self, user: &UserId) -> Result<Vec<TokenTransaction>, StoreError>;
}

/// Idempotency rows keyed by `(user, endpoint, key)`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert `record` unless a live row exists; returns the existing row.
    /// Rows past `expires_at` count as absent and are replaced.
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;
    async fn get(
        &self,
        user: &UserId,
        endpoint: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;
    /// `PENDING -> status` with the stored response. Returns `false` when
    /// the row is missing or no longer pending.
    async fn complete(
        &self,
        user: &UserId,
        endpoint: &str,
        key: &str,
        status: IdempotencyStatus,
        response: StoredResponse,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Delete rows created before `cutoff`; returns the count.
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
    /// `PENDING` rows created before `cutoff`.
    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<IdempotencyRecord>, StoreError>;
}
