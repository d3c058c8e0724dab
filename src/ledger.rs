//! Token ledger: the only writer of balances and ledger rows.
//!
//! Every mutation is one [`LedgerStore::apply`] call that updates the
//! balance (conditionally, for debits) and appends the matching row, so
//! `sum(amount) == balance` holds per user. Lock contention is retried
//! with bounded exponential backoff.

use crate::clock::Clock;
use crate::error::{MeterError, StoreError};
use crate::model::{TokenTransaction, TransactionType, User, UserId};
use crate::retry::RetryPolicy;
use crate::store::{LedgerEntry, LedgerOutcome, LedgerStore};
use crate::tariff::TariffRegistry;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Business reference recorded on a ledger row.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerRef {
    pub ref_id: String,
    pub details: JsonValue,
}

impl LedgerRef {
    pub fn new(ref_id: impl Into<String>) -> Self {
        Self { ref_id: ref_id.into(), details: JsonValue::Object(Default::default()) }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}

/// Result of [`TokenLedger::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Check {
    pub sufficient: bool,
    pub balance: i64,
    pub required: i64,
}

/// A committed mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct Posted {
    /// `None` for zero-amount debits, which write nothing.
    pub transaction: Option<TokenTransaction>,
    /// Absolute tokens moved.
    pub amount: i64,
    pub balance: i64,
}

pub struct TokenLedger {
    store: Arc<dyn LedgerStore>,
    tariffs: Arc<TariffRegistry>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    balance_ttl_ms: u64,
    balances: Mutex<HashMap<UserId, (i64, u64)>>,
}

impl std::fmt::Debug for TokenLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLedger")
            .field("retry", &self.retry)
            .field("balance_ttl_ms", &self.balance_ttl_ms)
            .finish()
    }
}

fn unknown_user(e: StoreError) -> MeterError {
    match e {
        StoreError::NotFound(what) => MeterError::ClientInput(format!("{what} not found")),
        other => MeterError::Dependency(other),
    }
}

impl TokenLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        tariffs: Arc<TariffRegistry>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        balance_cache: Duration,
    ) -> Self {
        Self {
            store,
            tariffs,
            clock,
            retry,
            balance_ttl_ms: u64::try_from(balance_cache.as_millis()).unwrap_or(u64::MAX),
            balances: Mutex::new(HashMap::new()),
        }
    }

    fn balances(&self) -> MutexGuard<'_, HashMap<UserId, (i64, u64)>> {
        self.balances.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn remember(&self, user: &UserId, balance: i64) {
        let expires = self.clock.now_millis().saturating_add(self.balance_ttl_ms);
        self.balances().insert(user.clone(), (balance, expires));
    }

    /// Forget cached balances past their expiry.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut balances = self.balances();
        let before = balances.len();
        balances.retain(|_, (_, expires)| *expires > now);
        before - balances.len()
    }

    pub async fn user(&self, user: &UserId) -> Result<Option<User>, MeterError> {
        let store = self.store.clone();
        let found = self.retry.run("ledger.user", || {
            let store = store.clone();
            let user = user.clone();
            async move { store.user(&user).await }
        });
        Ok(found.await?)
    }

    async fn price_of(&self, service: &str, action: &str, qty: u32) -> Result<i64, MeterError> {
        if qty == 0 {
            return Err(MeterError::ClientInput("quantity must be at least 1".into()));
        }
        let unit = self.tariffs.price(service, action).await?;
        i64::from(unit)
            .checked_mul(i64::from(qty))
            .ok_or_else(|| MeterError::ClientInput("quantity too large".into()))
    }

    /// Whether the user's balance covers `qty` units of `(service, action)`.
    pub async fn check(
        &self,
        user: &UserId,
        service: &str,
        action: &str,
        qty: u32,
    ) -> Result<Check, MeterError> {
        let required = self.price_of(service, action, qty).await?;
        let row = self
            .user(user)
            .await?
            .ok_or_else(|| MeterError::ClientInput(format!("user {user} not found")))?;
        self.remember(user, row.token_balance);
        Ok(Check {
            sufficient: row.token_balance >= required,
            balance: row.token_balance,
            required,
        })
    }

    /// Debit `price(service, action) * qty`.
    pub async fn consume_by_rule(
        &self,
        user: &UserId,
        service: &str,
        action: &str,
        qty: u32,
        reference: &LedgerRef,
    ) -> Result<Posted, MeterError> {
        let amount = self.price_of(service, action, qty).await?;
        self.debit(user, amount, service, action, reference).await
    }

    /// Debit a precomputed amount, bypassing the tariff.
    pub async fn consume_exact(
        &self,
        user: &UserId,
        amount: i64,
        service: &str,
        action: &str,
        reference: &LedgerRef,
    ) -> Result<Posted, MeterError> {
        if amount < 0 {
            return Err(MeterError::ClientInput("debit amount must not be negative".into()));
        }
        self.debit(user, amount, service, action, reference).await
    }

    async fn debit(
        &self,
        user: &UserId,
        amount: i64,
        service: &str,
        action: &str,
        reference: &LedgerRef,
    ) -> Result<Posted, MeterError> {
        if amount == 0 {
            let balance = self.balance(user).await?;
            return Ok(Posted { transaction: None, amount: 0, balance });
        }
        let entry = LedgerEntry {
            user_id: user.clone(),
            amount: -amount,
            kind: TransactionType::Consume,
            service: service.to_string(),
            action: action.to_string(),
            ref_id: reference.ref_id.clone(),
            details: reference.details.clone(),
        };
        match self.apply(entry).await? {
            LedgerOutcome::Applied { transaction, balance } => {
                debug!(
                    target: "metered::ledger",
                    %user,
                    service,
                    action,
                    reference = %reference.ref_id,
                    amount,
                    balance,
                    "debited"
                );
                self.remember(user, balance);
                Ok(Posted { transaction: Some(transaction), amount, balance })
            }
            LedgerOutcome::Insufficient { balance } => {
                self.remember(user, balance);
                Err(MeterError::InsufficientTokens { required: amount, balance })
            }
        }
    }

    /// Credit back a failed debit; same `ref` as the consume row.
    pub async fn refund(
        &self,
        user: &UserId,
        amount: i64,
        service: &str,
        action: &str,
        reference: &LedgerRef,
    ) -> Result<Posted, MeterError> {
        if amount <= 0 {
            return Err(MeterError::ClientInput("refund amount must be positive".into()));
        }
        let entry = LedgerEntry {
            user_id: user.clone(),
            amount,
            kind: TransactionType::Refund,
            service: service.to_string(),
            action: action.to_string(),
            ref_id: reference.ref_id.clone(),
            details: reference.details.clone(),
        };
        self.post_credit(user, entry).await
    }

    /// Purchases, check-ins, invites and admin adjustments.
    pub async fn credit(
        &self,
        user: &UserId,
        amount: i64,
        kind: TransactionType,
        reference: &LedgerRef,
    ) -> Result<Posted, MeterError> {
        if !kind.is_plain_credit() {
            return Err(MeterError::ClientInput(format!("{} is not a credit type", kind.as_str())));
        }
        if amount <= 0 {
            return Err(MeterError::ClientInput("credit amount must be positive".into()));
        }
        let entry = LedgerEntry {
            user_id: user.clone(),
            amount,
            kind,
            service: String::new(),
            action: String::new(),
            ref_id: reference.ref_id.clone(),
            details: reference.details.clone(),
        };
        self.post_credit(user, entry).await
    }

    async fn post_credit(&self, user: &UserId, entry: LedgerEntry) -> Result<Posted, MeterError> {
        let amount = entry.amount;
        let kind = entry.kind;
        match self.apply(entry).await? {
            LedgerOutcome::Applied { transaction, balance } => {
                info!(
                    target: "metered::ledger",
                    %user,
                    kind = kind.as_str(),
                    reference = %transaction.ref_id,
                    amount,
                    balance,
                    "credited"
                );
                self.remember(user, balance);
                Ok(Posted { transaction: Some(transaction), amount, balance })
            }
            LedgerOutcome::Insufficient { balance } => Err(MeterError::Internal(format!(
                "credit of {amount} rejected as insufficient at balance {balance}"
            ))),
        }
    }

    async fn apply(&self, entry: LedgerEntry) -> Result<LedgerOutcome, MeterError> {
        let store = self.store.clone();
        self.retry
            .run("ledger.apply", || {
                let store = store.clone();
                let entry = entry.clone();
                async move { store.apply(entry).await }
            })
            .await
            .map_err(unknown_user)
    }

    /// Balance, served from a short-lived cache.
    pub async fn balance(&self, user: &UserId) -> Result<i64, MeterError> {
        let now = self.clock.now_millis();
        let cached = self.balances().get(user).copied();
        if let Some((balance, expires)) = cached {
            if expires > now {
                return Ok(balance);
            }
        }
        let row = self
            .user(user)
            .await?
            .ok_or_else(|| MeterError::ClientInput(format!("user {user} not found")))?;
        self.remember(user, row.token_balance);
        Ok(row.token_balance)
    }

    /// Ledger rows of `user`, oldest first.
    pub async fn history(&self, user: &UserId) -> Result<Vec<TokenTransaction>, MeterError> {
        Ok(self.store.transactions(user).await?)
    }

    /// Rows of `user` carrying `ref_id`.
    pub async fn find_by_ref(
        &self,
        user: &UserId,
        ref_id: &str,
    ) -> Result<Vec<TokenTransaction>, MeterError> {
        Ok(self.history(user).await?.into_iter().filter(|tx| tx.ref_id == ref_id).collect())
    }
}
