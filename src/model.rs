//! Rows and value types shared by the core components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// User identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Disabled,
}

/// The balance container. The ledger is the only writer of `token_balance`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub status: UserStatus,
    pub token_balance: i64,
}

/// Plan name, normalized to upper case (`FREE`, `PRO`, `MAX`, or operator-defined).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanName(String);

impl PlanName {
    pub const FREE: &'static str = "FREE";
    pub const PRO: &'static str = "PRO";
    pub const MAX: &'static str = "MAX";

    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_uppercase())
    }

    pub fn free() -> Self {
        Self(Self::FREE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_free(&self) -> bool {
        self.0 == Self::FREE
    }
}

impl fmt::Display for PlanName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type PlanId = i64;
pub type SubscriptionId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanStatus {
    Active,
    Inactive,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: PlanName,
    pub duration_days: u32,
    pub status: PlanStatus,
    #[serde(default)]
    pub features: Vec<String>,
}

/// `ACTIVE -> CANCELLED` and `ACTIVE -> EXPIRED`; both targets are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubscriptionStatus::Active)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Price of one unit of work for a `(service, action)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffRule {
    pub id: i64,
    pub service: String,
    pub action: String,
    pub token_cost: u32,
    pub is_active: bool,
    #[serde(default)]
    pub description: String,
}

/// Upsert payload; `(service, action)` is the natural key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTariffRule {
    pub service: String,
    pub action: String,
    pub token_cost: u32,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Consume,
    Purchase,
    Refund,
    Checkin,
    Invite,
    Adjust,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Consume => "consume",
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Checkin => "checkin",
            TransactionType::Invite => "invite",
            TransactionType::Adjust => "adjust",
        }
    }

    /// Types accepted by `TokenLedger::credit`.
    pub fn is_plain_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Purchase
                | TransactionType::Checkin
                | TransactionType::Invite
                | TransactionType::Adjust
        )
    }
}

/// Append-only ledger row. Negative `amount` debits, positive credits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: u64,
    pub user_id: UserId,
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub service: String,
    pub action: String,
    pub ref_id: String,
    pub details: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyStatus {
    Pending,
    Done,
    Failed,
}

/// Response kept for replay: status and the exact body bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub user_id: UserId,
    pub endpoint: String,
    pub key: String,
    pub status: IdempotencyStatus,
    pub response: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
