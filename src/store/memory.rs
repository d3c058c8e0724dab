//! In-memory datastore implementing every storage seam.
//!
//! All tables sit behind one mutex, so each trait method is a serializable
//! transaction. Faults can be queued per table to exercise retries and
//! dependency failures.

use super::{
    IdempotencyStore, LedgerEntry, LedgerOutcome, LedgerStore, RuleStore, SubscriptionStore,
};
use crate::audit::{AuditEvent, AuditSink};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::model::{
    IdempotencyRecord, IdempotencyStatus, NewTariffRule, Plan, PlanId, PlanName, PlanStatus,
    StoredResponse, Subscription, SubscriptionId, SubscriptionStatus, TariffRule,
    TokenTransaction, TransactionType, User, UserId, UserStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Table a queued fault applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultTarget {
    Rules,
    Subscriptions,
    Ledger,
    Idempotency,
    Audit,
}

type IdemKey = (UserId, String, String);

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    plans: BTreeMap<PlanId, Plan>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    rules: BTreeMap<i64, TariffRule>,
    ledger: Vec<TokenTransaction>,
    idempotency: HashMap<IdemKey, IdempotencyRecord>,
    audit: Vec<AuditEvent>,
    next_plan_id: PlanId,
    next_subscription_id: SubscriptionId,
    next_rule_id: i64,
    next_tx_id: u64,
}

/// Single-node reference datastore.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<HashMap<FaultTarget, VecDeque<StoreError>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.tables();
        f.debug_struct("MemoryStore")
            .field("users", &t.users.len())
            .field("ledger_rows", &t.ledger.len())
            .field("idempotency_rows", &t.idempotency.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { tables: Mutex::new(Tables::default()), faults: Mutex::new(HashMap::new()), clock }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue `err` to be returned by the next call touching `target`.
    pub fn inject_fault(&self, target: FaultTarget, err: StoreError) {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        faults.entry(target).or_default().push_back(err);
    }

    fn take_fault(&self, target: FaultTarget) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        match faults.get_mut(&target).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Create an active user. A positive opening balance is written through
    /// an `adjust` ledger row so the ledger sums to the balance.
    pub fn seed_user(&self, id: impl Into<UserId>, opening_balance: i64) -> User {
        let id = id.into();
        let now = self.clock.now();
        let mut t = self.tables();
        let user =
            User { id: id.clone(), status: UserStatus::Active, token_balance: opening_balance };
        if opening_balance != 0 {
            t.next_tx_id += 1;
            let tx = TokenTransaction {
                id: t.next_tx_id,
                user_id: id.clone(),
                amount: opening_balance,
                kind: TransactionType::Adjust,
                service: String::new(),
                action: String::new(),
                ref_id: "opening_balance".into(),
                details: json!({}),
                created_at: now,
            };
            t.ledger.push(tx);
        }
        t.users.insert(id, user.clone());
        user
    }

    pub fn set_user_status(&self, id: &UserId, status: UserStatus) {
        if let Some(user) = self.tables().users.get_mut(id) {
            user.status = status;
        }
    }

    pub fn add_plan(&self, name: &str, duration_days: u32) -> Plan {
        let mut t = self.tables();
        t.next_plan_id += 1;
        let plan = Plan {
            id: t.next_plan_id,
            name: PlanName::new(name),
            duration_days,
            status: PlanStatus::Active,
            features: Vec::new(),
        };
        t.plans.insert(plan.id, plan.clone());
        plan
    }

    pub fn set_plan_status(&self, id: PlanId, status: PlanStatus) {
        if let Some(plan) = self.tables().plans.get_mut(&id) {
            plan.status = status;
        }
    }

    /// Insert a subscription row verbatim (for fixtures that need odd states).
    pub fn insert_subscription(&self, mut sub: Subscription) -> Subscription {
        let mut t = self.tables();
        t.next_subscription_id += 1;
        sub.id = t.next_subscription_id;
        t.subscriptions.insert(sub.id, sub.clone());
        sub
    }

    pub fn subscriptions_for(&self, user: &UserId) -> Vec<Subscription> {
        self.tables().subscriptions.values().filter(|s| &s.user_id == user).cloned().collect()
    }

    /// `sum(amount)` over the user's ledger rows.
    pub fn ledger_sum(&self, user: &UserId) -> i64 {
        self.tables().ledger.iter().filter(|tx| &tx.user_id == user).map(|tx| tx.amount).sum()
    }

    /// The user's ledger rows, oldest first.
    pub fn ledger_rows(&self, user: &UserId) -> Vec<TokenTransaction> {
        self.tables().ledger.iter().filter(|tx| &tx.user_id == user).cloned().collect()
    }

    pub fn balance_of(&self, user: &UserId) -> Option<i64> {
        self.tables().users.get(user).map(|u| u.token_balance)
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.tables().audit.clone()
    }

    pub fn idempotency_rows(&self) -> Vec<IdempotencyRecord> {
        self.tables().idempotency.values().cloned().collect()
    }

    fn rule_key(service: &str, action: &str) -> (String, String) {
        (service.trim().to_ascii_lowercase(), action.trim().to_ascii_lowercase())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn active_rules(&self) -> Result<Vec<TariffRule>, StoreError> {
        self.take_fault(FaultTarget::Rules)?;
        Ok(self.tables().rules.values().filter(|r| r.is_active).cloned().collect())
    }

    async fn all_rules(&self) -> Result<Vec<TariffRule>, StoreError> {
        self.take_fault(FaultTarget::Rules)?;
        Ok(self.tables().rules.values().cloned().collect())
    }

    async fn upsert_rule(&self, rule: NewTariffRule) -> Result<TariffRule, StoreError> {
        self.take_fault(FaultTarget::Rules)?;
        let (service, action) = Self::rule_key(&rule.service, &rule.action);
        if service.is_empty() || action.is_empty() {
            return Err(StoreError::Invalid("service and action are required".into()));
        }
        let mut t = self.tables();
        let existing =
            t.rules.values_mut().find(|r| r.service == service && r.action == action);
        if let Some(row) = existing {
            row.token_cost = rule.token_cost;
            row.description = rule.description;
            row.is_active = true;
            return Ok(row.clone());
        }
        t.next_rule_id += 1;
        let row = TariffRule {
            id: t.next_rule_id,
            service,
            action,
            token_cost: rule.token_cost,
            is_active: true,
            description: rule.description,
        };
        t.rules.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_rule_active(&self, id: i64, active: bool) -> Result<TariffRule, StoreError> {
        self.take_fault(FaultTarget::Rules)?;
        let mut t = self.tables();
        let row = t
            .rules
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("tariff rule {id}")))?;
        row.is_active = active;
        Ok(row.clone())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn plan(&self, id: PlanId) -> Result<Option<Plan>, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        Ok(self.tables().plans.get(&id).cloned())
    }

    async fn active_subscription(
        &self,
        user: &UserId,
    ) -> Result<Option<(Subscription, Plan)>, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        let t = self.tables();
        let latest = t
            .subscriptions
            .values()
            .filter(|s| &s.user_id == user && s.status == SubscriptionStatus::Active)
            .max_by_key(|s| (s.started_at, s.id));
        Ok(latest.and_then(|s| t.plans.get(&s.plan_id).map(|p| (s.clone(), p.clone()))))
    }

    async fn subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        Ok(self.tables().subscriptions.get(&id).cloned())
    }

    async fn assign(
        &self,
        user: &UserId,
        plan_id: PlanId,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        let mut t = self.tables();
        if !t.plans.contains_key(&plan_id) {
            return Err(StoreError::NotFound(format!("plan {plan_id}")));
        }
        for sub in t.subscriptions.values_mut() {
            if &sub.user_id == user && sub.status == SubscriptionStatus::Active {
                sub.status = SubscriptionStatus::Cancelled;
                sub.updated_at = started_at;
            }
        }
        t.next_subscription_id += 1;
        let sub = Subscription {
            id: t.next_subscription_id,
            user_id: user.clone(),
            plan_id,
            status: SubscriptionStatus::Active,
            started_at,
            ended_at,
            updated_at: started_at,
        };
        t.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn cancel(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        let mut t = self.tables();
        let sub = active_row(&mut t, id)?;
        sub.status = SubscriptionStatus::Cancelled;
        sub.updated_at = at;
        Ok(sub.clone())
    }

    async fn extend(
        &self,
        id: SubscriptionId,
        ended_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        let mut t = self.tables();
        let sub = active_row(&mut t, id)?;
        sub.ended_at = ended_at;
        sub.updated_at = at;
        Ok(sub.clone())
    }

    async fn change_plan(
        &self,
        id: SubscriptionId,
        plan_id: PlanId,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        let mut t = self.tables();
        if !t.plans.contains_key(&plan_id) {
            return Err(StoreError::NotFound(format!("plan {plan_id}")));
        }
        let sub = active_row(&mut t, id)?;
        sub.plan_id = plan_id;
        sub.updated_at = at;
        Ok(sub.clone())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        let mut t = self.tables();
        let mut moved = Vec::new();
        for sub in t.subscriptions.values_mut() {
            if sub.status == SubscriptionStatus::Active && sub.ended_at < now {
                sub.status = SubscriptionStatus::Expired;
                sub.updated_at = now;
                moved.push(sub.clone());
            }
        }
        Ok(moved)
    }

    async fn ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.take_fault(FaultTarget::Subscriptions)?;
        Ok(self
            .tables()
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active && s.ended_at >= from && s.ended_at < to
            })
            .cloned()
            .collect())
    }
}

fn active_row(t: &mut Tables, id: SubscriptionId) -> Result<&mut Subscription, StoreError> {
    let sub = t
        .subscriptions
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("subscription {id}")))?;
    if sub.status.is_terminal() {
        return Err(StoreError::Invalid(format!("subscription {id} is {:?}", sub.status)));
    }
    Ok(sub)
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        self.take_fault(FaultTarget::Ledger)?;
        Ok(self.tables().users.get(id).cloned())
    }

    async fn apply(&self, entry: LedgerEntry) -> Result<LedgerOutcome, StoreError> {
        self.take_fault(FaultTarget::Ledger)?;
        let now = self.clock.now();
        let mut t = self.tables();
        let user = t
            .users
            .get_mut(&entry.user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", entry.user_id)))?;
        if entry.amount < 0 && user.token_balance < -entry.amount {
            return Ok(LedgerOutcome::Insufficient { balance: user.token_balance });
        }
        user.token_balance += entry.amount;
        let balance = user.token_balance;
        t.next_tx_id += 1;
        let tx = TokenTransaction {
            id: t.next_tx_id,
            user_id: entry.user_id,
            amount: entry.amount,
            kind: entry.kind,
            service: entry.service,
            action: entry.action,
            ref_id: entry.ref_id,
            details: entry.details,
            created_at: now,
        };
        t.ledger.push(tx.clone());
        Ok(LedgerOutcome::Applied { transaction: tx, balance })
    }

    async fn transactions(&self, user: &UserId) -> Result<Vec<TokenTransaction>, StoreError> {
        self.take_fault(FaultTarget::Ledger)?;
        Ok(self.tables().ledger.iter().filter(|tx| &tx.user_id == user).cloned().collect())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.take_fault(FaultTarget::Idempotency)?;
        let key = (record.user_id.clone(), record.endpoint.clone(), record.key.clone());
        let mut t = self.tables();
        if let Some(existing) = t.idempotency.get(&key) {
            if existing.expires_at > record.created_at {
                return Ok(Some(existing.clone()));
            }
        }
        t.idempotency.insert(key, record);
        Ok(None)
    }

    async fn get(
        &self,
        user: &UserId,
        endpoint: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.take_fault(FaultTarget::Idempotency)?;
        let k = (user.clone(), endpoint.to_string(), key.to_string());
        Ok(self.tables().idempotency.get(&k).cloned())
    }

    async fn complete(
        &self,
        user: &UserId,
        endpoint: &str,
        key: &str,
        status: IdempotencyStatus,
        response: StoredResponse,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.take_fault(FaultTarget::Idempotency)?;
        let k = (user.clone(), endpoint.to_string(), key.to_string());
        let mut t = self.tables();
        match t.idempotency.get_mut(&k) {
            Some(row) if row.status == IdempotencyStatus::Pending => {
                row.status = status;
                row.response = Some(response);
                row.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.take_fault(FaultTarget::Idempotency)?;
        let mut t = self.tables();
        let before = t.idempotency.len();
        t.idempotency.retain(|_, row| row.created_at >= cutoff);
        Ok((before - t.idempotency.len()) as u64)
    }

    async fn pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<IdempotencyRecord>, StoreError> {
        self.take_fault(FaultTarget::Idempotency)?;
        Ok(self
            .tables()
            .idempotency
            .values()
            .filter(|row| row.status == IdempotencyStatus::Pending && row.created_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.take_fault(FaultTarget::Audit)?;
        self.tables().audit.push(event);
        Ok(())
    }
}
