//! Append-only audit trail for admission decisions.
//!
//! The envelope writes one event per terminal outcome. Writes are
//! best-effort: a failing sink is logged and never changes the response.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, warn};

/// What the audited decision was.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    /// Tokens debited and the handler succeeded.
    #[serde(rename = "tokens.debit")]
    Debit,
    /// Tokens returned after a handler failure.
    #[serde(rename = "tokens.refund")]
    Refund,
    /// Stored response replayed.
    #[serde(rename = "idempotency.replay")]
    Replay,
    /// Duplicate of an in-flight request.
    #[serde(rename = "idempotency.duplicate")]
    Duplicate,
    /// Rejected before the handler ran.
    #[serde(rename = "admission.denied")]
    Denied,
    /// Handler failed and nothing was refunded.
    #[serde(rename = "request.failed")]
    Failed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Debit => "tokens.debit",
            AuditAction::Refund => "tokens.refund",
            AuditAction::Replay => "idempotency.replay",
            AuditAction::Duplicate => "idempotency.duplicate",
            AuditAction::Denied => "admission.denied",
            AuditAction::Failed => "request.failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: String,
    pub action: AuditAction,
    pub resource: String,
    pub resource_id: String,
    pub details: JsonValue,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Audit sink interface.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError>;
}

/// Logs events via tracing.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        info!(
            target: "metered::audit",
            actor = %event.actor,
            action = event.action.as_str(),
            resource = %event.resource,
            resource_id = %event.resource_id,
            ok = event.ok,
            error = event.error.as_deref().unwrap_or(""),
            latency_ms = event.latency_ms,
            "audit"
        );
        Ok(())
    }
}

/// Writes every event to each inner sink; reports the first failure.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event.clone()).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Record without letting a sink failure escape.
pub async fn record_best_effort(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action.as_str();
    if let Err(e) = sink.record(event).await {
        warn!(target: "metered::audit", action, error = %e, "audit write failed");
    }
}
