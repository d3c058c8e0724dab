//! Admission envelope: the fixed protocol every metered endpoint runs.
//!
//! identity → plan → rate limit → validation → idempotency → balance check
//! → debit → handler → settlement. Settlement (refund, idempotency
//! completion, audit) runs on a spawned task under a detached deadline, so
//! a caller that goes away after the debit still leaves the ledger and the
//! idempotency row consistent.

mod handler;
mod layer;
mod request;
mod response;

pub use handler::{
    array_len, handler_fn, BusinessHandler, FnHandler, HandlerError, HandlerRequest,
    HandlerResponse, ServiceHandler,
};
pub use layer::{MeteredLayer, MeteredService};
pub use request::{EndpointTag, MeteredRequest, Route};
pub use response::{
    MeteredResponse, SERVER_TIMING, X_IDEMPOTENT_REPLAY, X_REQUEST_ID, X_TOKENS_BALANCE,
    X_TOKENS_CONSUMED,
};

use crate::audit::{record_best_effort, AuditAction, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::config::EnvelopeConfig;
use crate::deadline::Deadline;
use crate::error::{ErrorKind, MeterError};
use crate::idempotency::{normalize_key, BeginOutcome, IdempotencyKeeper, Outcome};
use crate::identity::IdentityResolver;
use crate::ledger::{LedgerRef, TokenLedger};
use crate::model::{StoredResponse, UserId, UserStatus};
use crate::plan::PlanRegistry;
use crate::rate_limit::{AdmissionLimiter, Subject, Verdict};
use futures::FutureExt;
use http::StatusCode;
use serde_json::{json, Value as JsonValue};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Timeouts the envelope applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvelopeSettings {
    pub handler_timeout: Duration,
    pub operation_timeout: Duration,
    pub finalize_timeout: Duration,
}

impl Default for EnvelopeSettings {
    fn default() -> Self {
        Self::from(&EnvelopeConfig::default())
    }
}

impl From<&EnvelopeConfig> for EnvelopeSettings {
    fn from(cfg: &EnvelopeConfig) -> Self {
        Self {
            handler_timeout: Duration::from_millis(cfg.handler_timeout_ms),
            operation_timeout: Duration::from_millis(cfg.operation_timeout_ms),
            finalize_timeout: Duration::from_millis(cfg.finalize_timeout_ms),
        }
    }
}

/// Components the envelope drives.
pub struct EnvelopeParts {
    pub identity: Arc<dyn IdentityResolver>,
    pub plans: Arc<PlanRegistry>,
    pub limiter: Arc<AdmissionLimiter>,
    pub idempotency: Arc<IdempotencyKeeper>,
    pub ledger: Arc<TokenLedger>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub settings: EnvelopeSettings,
}

/// Runs metered calls. Cheap to clone.
#[derive(Clone)]
pub struct Envelope {
    inner: Arc<EnvelopeParts>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").field("settings", &self.inner.settings).finish_non_exhaustive()
    }
}

/// Per-call bookkeeping for headers and audit.
#[derive(Clone, Debug)]
struct CallContext {
    request_id: String,
    route: Arc<Route>,
    actor: String,
    ip: Option<String>,
    user_agent: Option<String>,
    started: Instant,
    handler_time: Option<Duration>,
    verdict: Option<Verdict>,
}

impl CallContext {
    fn new(req: &MeteredRequest) -> Self {
        Self {
            request_id: req.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            route: req.route.clone(),
            actor: "anonymous".to_string(),
            ip: req.ip.clone(),
            user_agent: req.user_agent.clone(),
            started: Instant::now(),
            handler_time: None,
            verdict: None,
        }
    }

    fn decorate(&self, resp: &mut MeteredResponse) {
        resp.set(X_REQUEST_ID, &self.request_id);
        let mut phases = vec![("total", self.started.elapsed())];
        if let Some(h) = self.handler_time {
            phases.push(("handler", h));
        }
        resp.set(SERVER_TIMING, response::server_timing(&phases));
        if let Some(v) = &self.verdict {
            v.apply_headers(&mut resp.headers);
        }
    }

    async fn audit(
        &self,
        parts: &EnvelopeParts,
        action: AuditAction,
        error: Option<String>,
        details: JsonValue,
    ) {
        let event = AuditEvent {
            actor: self.actor.clone(),
            action,
            resource: self.route.tag.to_string(),
            resource_id: self.request_id.clone(),
            details,
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            ok: error.is_none(),
            error,
            latency_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            created_at: parts.clock.now(),
        };
        let write = record_best_effort(parts.audit.as_ref(), event);
        if tokio::time::timeout(parts.settings.finalize_timeout, write).await.is_err() {
            warn!(target: "metered::audit", action = action.as_str(), "audit write timed out");
        }
    }
}

fn handler_error(e: HandlerError) -> MeterError {
    match e {
        HandlerError::Validation(msg) => MeterError::ClientInput(msg),
        HandlerError::Upstream { status, message } => {
            MeterError::BusinessFailure { status, message }
        }
        HandlerError::Internal(msg) => MeterError::Internal(msg),
    }
}

fn status_of(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// How a call that reached settlement ended.
#[derive(Debug)]
enum Settlement {
    Success { status: u16, body: JsonValue },
    /// `refundable` is false only when the caller's own input was at fault.
    Failure { status: u16, body: String, error: String, refundable: bool },
    /// The caller went away before the handler finished.
    Abandoned,
}

impl Settlement {
    fn from_error(e: &MeterError) -> Self {
        Settlement::Failure {
            status: e.status().as_u16(),
            body: e.body().to_string(),
            error: e.to_string(),
            refundable: e.kind() != ErrorKind::ClientInput,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Debit {
    amount: i64,
    balance: i64,
}

/// Everything settlement needs once idempotency or the ledger has been
/// touched.
struct Pending {
    parts: Arc<EnvelopeParts>,
    ctx: CallContext,
    user: UserId,
    key: Option<String>,
    reference: LedgerRef,
    debit: Option<Debit>,
}

impl Pending {
    fn needs_settlement(&self) -> bool {
        self.key.is_some() || self.debit.is_some_and(|d| d.amount > 0)
    }

    async fn settle(self, settlement: Settlement) -> MeteredResponse {
        let parts = &self.parts;
        let route = &self.ctx.route;
        let d = Deadline::detached(parts.settings.finalize_timeout);
        let amount = self.debit.map_or(0, |d| d.amount);
        let mut balance = self.debit.map(|d| d.balance);

        let (status, body, outcome, error, refund_due) = match settlement {
            Settlement::Success { status, mut body } => {
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("consumed".into(), json!(amount));
                    if let Some(b) = balance {
                        obj.insert("balance".into(), json!(b));
                    }
                }
                (status, body.to_string(), Outcome::Done, None, false)
            }
            Settlement::Failure { status, body, error, refundable } => {
                (status, body, Outcome::Failed, Some(error), refundable)
            }
            Settlement::Abandoned => (
                499,
                json!({ "code": 499, "message": "client_closed_request" }).to_string(),
                Outcome::Failed,
                Some("request abandoned before completion".to_string()),
                true,
            ),
        };

        let mut consumed = amount;
        let mut refunded = false;
        if refund_due && amount > 0 {
            let refund = parts.ledger.refund(
                &self.user,
                amount,
                route.tag.service,
                route.tag.action,
                &self.reference,
            );
            match d.run("ledger.refund", refund).await {
                Ok(posted) => {
                    consumed = 0;
                    balance = Some(posted.balance);
                    refunded = true;
                }
                Err(e) => {
                    error!(
                        target: "metered::envelope",
                        user = %self.user,
                        amount,
                        error = %e,
                        "refund failed; debit left in place"
                    );
                }
            }
        }

        if let Some(key) = &self.key {
            let stored = StoredResponse { status, body: body.clone() };
            let finish = parts.idempotency.finish(&self.user, &route.name, key, stored, outcome);
            if let Err(e) = d.run("idempotency.finish", finish).await {
                error!(
                    target: "metered::envelope",
                    user = %self.user,
                    key = %key,
                    error = %e,
                    "idempotency finalization failed"
                );
            }
        }

        let action = if refunded {
            AuditAction::Refund
        } else if outcome == Outcome::Done {
            AuditAction::Debit
        } else if self.debit.is_none() && (400..500).contains(&status) {
            AuditAction::Denied
        } else {
            AuditAction::Failed
        };
        let details = json!({
            "endpoint": route.name,
            "status": status,
            "amount": amount,
            "consumed": consumed,
            "refunded": refunded,
            "balance": balance,
            "idempotency_key": self.key,
        });
        info!(
            target: "metered::envelope",
            user = %self.user,
            endpoint = %route.name,
            status,
            consumed,
            refunded,
            "settled"
        );
        self.ctx.audit(parts, action, error, details).await;

        let mut resp = MeteredResponse::new(status_of(status), body);
        if self.debit.is_some() {
            resp.set(X_TOKENS_CONSUMED, consumed);
            if let Some(b) = balance {
                resp.set(X_TOKENS_BALANCE, b);
            }
        }
        resp
    }
}

/// Settles on drop if the request future is cancelled mid-flight.
struct SettleGuard(Option<Pending>);

impl SettleGuard {
    fn debited(&mut self, amount: i64, balance: i64) {
        if let Some(p) = &mut self.0 {
            p.debit = Some(Debit { amount, balance });
        }
    }

    async fn settle(mut self, settlement: Settlement) -> MeteredResponse {
        let Some(pending) = self.0.take() else {
            return MeteredResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &MeterError::Internal("already settled".into()).body(),
            );
        };
        match tokio::spawn(pending.settle(settlement)).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(target: "metered::envelope", error = %e, "settlement task failed");
                MeteredResponse::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &MeterError::Internal("settlement failed".into()).body(),
                )
            }
        }
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let Some(pending) = self.0.take() else { return };
        if !pending.needs_settlement() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    target: "metered::envelope",
                    user = %pending.user,
                    endpoint = %pending.ctx.route.name,
                    "request dropped before settlement"
                );
                handle.spawn(pending.settle(Settlement::Abandoned));
            }
            Err(_) => {
                error!(
                    target: "metered::envelope",
                    user = %pending.user,
                    "no runtime to settle dropped request"
                );
            }
        }
    }
}

impl Envelope {
    pub fn new(parts: EnvelopeParts) -> Self {
        Self { inner: Arc::new(parts) }
    }

    pub fn settings(&self) -> EnvelopeSettings {
        self.inner.settings
    }

    pub fn ledger(&self) -> &Arc<TokenLedger> {
        &self.inner.ledger
    }

    /// Run one metered call to completion. Never fails; every outcome is a
    /// response.
    pub async fn handle(
        &self,
        req: MeteredRequest,
        handler: &dyn BusinessHandler,
    ) -> MeteredResponse {
        let mut ctx = CallContext::new(&req);
        let span = info_span!("metered", request_id = %ctx.request_id, endpoint = %req.route.name);
        let mut resp = self.run(req, handler, &mut ctx).instrument(span).await;
        ctx.decorate(&mut resp);
        resp
    }

    async fn reject(&self, ctx: &CallContext, err: MeterError) -> MeteredResponse {
        let action = if err.is_client_error() { AuditAction::Denied } else { AuditAction::Failed };
        let kind = err.kind().as_str();
        debug!(target: "metered::envelope", actor = %ctx.actor, kind, error = %err, "rejected");
        let details = json!({ "endpoint": ctx.route.name, "kind": kind });
        ctx.audit(&self.inner, action, Some(err.to_string()), details).await;
        MeteredResponse::json(err.status(), &err.body())
    }

    async fn replay(
        &self,
        ctx: &CallContext,
        key: &str,
        stored: StoredResponse,
    ) -> MeteredResponse {
        let details = json!({
            "endpoint": ctx.route.name,
            "idempotency_key": key,
            "status": stored.status,
        });
        ctx.audit(&self.inner, AuditAction::Replay, None, details).await;
        let mut resp = MeteredResponse::new(status_of(stored.status), stored.body);
        resp.set(X_IDEMPOTENT_REPLAY, "true");
        resp
    }

    async fn run(
        &self,
        req: MeteredRequest,
        handler: &dyn BusinessHandler,
        ctx: &mut CallContext,
    ) -> MeteredResponse {
        let parts = &self.inner;
        let route = req.route.clone();
        let deadline = Deadline::new(parts.settings.operation_timeout).with_budget(req.budget);

        let resolved = deadline.run("identity", parts.identity.resolve(&req.credential)).await;
        let identity = match resolved {
            Ok(identity) => identity,
            Err(e) => return self.reject(ctx, e).await,
        };
        let user = identity.user;
        ctx.actor = user.to_string();
        match deadline.run("ledger.user", parts.ledger.user(&user)).await {
            Ok(Some(row)) if row.status == UserStatus::Active => {}
            Ok(Some(_)) => {
                return self.reject(ctx, MeterError::Forbidden("account disabled".into())).await
            }
            Ok(None) => {
                return self.reject(ctx, MeterError::Unauthorized("unknown user".into())).await
            }
            Err(e) => return self.reject(ctx, e).await,
        }

        let resolved = deadline
            .run("plan", async { Ok::<_, MeterError>(parts.plans.plan(&user).await) })
            .await;
        let plan = match resolved {
            Ok(plan) => plan,
            Err(e) => return self.reject(ctx, e).await,
        };

        let subject = Subject {
            user: &user,
            plan: &plan,
            ip: ctx.ip.as_deref(),
            method: route.method.as_str(),
            path: &route.path,
            service: route.tag.service,
            action: route.tag.action,
        };
        let verdict = deadline
            .run("rate_limit", async {
                parts.limiter.check(&subject).await.map_err(MeterError::from)
            })
            .await;
        match verdict {
            Ok(v) => {
                let denied = (!v.is_allowed()).then(|| v.to_error());
                ctx.verdict = Some(v);
                if let Some(err) = denied {
                    return self.reject(ctx, err).await;
                }
            }
            Err(e) => return self.reject(ctx, e).await,
        }

        let key = match normalize_key(req.idempotency_key.as_deref()) {
            Ok(key) => key,
            Err(e) => return self.reject(ctx, e).await,
        };
        let quantity = match handler.quantity(&req.body) {
            Ok(q) if q > 0 => q,
            Ok(_) => {
                return self.reject(ctx, MeterError::ClientInput("nothing to meter".into())).await
            }
            Err(e) => return self.reject(ctx, handler_error(e)).await,
        };

        if let Some(key) = &key {
            let begin = parts.idempotency.begin(&user, &route.name, key);
            match deadline.run("idempotency.begin", begin).await {
                Ok(BeginOutcome::Fresh) => {}
                Ok(BeginOutcome::DuplicatePending) => {
                    let err = MeterError::IdempotentDuplicate;
                    let details = json!({ "endpoint": route.name, "idempotency_key": key });
                    ctx.audit(parts, AuditAction::Duplicate, None, details).await;
                    return MeteredResponse::json(err.status(), &err.body());
                }
                Ok(BeginOutcome::DuplicateDone(stored))
                | Ok(BeginOutcome::DuplicateFailed(stored)) => {
                    return self.replay(ctx, key, stored).await;
                }
                Err(e) => return self.reject(ctx, e).await,
            }
        }

        let reference = LedgerRef::new(route.name.clone()).with_details(json!({
            "request_id": ctx.request_id,
            "idempotency_key": key,
            "quantity": quantity,
        }));
        let mut guard = SettleGuard(Some(Pending {
            parts: parts.clone(),
            ctx: ctx.clone(),
            user: user.clone(),
            key,
            reference: reference.clone(),
            debit: None,
        }));

        let (service, action) = (route.tag.service, route.tag.action);
        let check = parts.ledger.check(&user, service, action, quantity);
        match deadline.run("ledger.check", check).await {
            Ok(check) if !check.sufficient => {
                let err = MeterError::InsufficientTokens {
                    required: check.required,
                    balance: check.balance,
                };
                return guard.settle(Settlement::from_error(&err)).await;
            }
            Ok(_) => {}
            Err(e) => return guard.settle(Settlement::from_error(&e)).await,
        }
        let debit = parts.ledger.consume_by_rule(&user, service, action, quantity, &reference);
        match deadline.run("ledger.debit", debit).await {
            Ok(posted) => guard.debited(posted.amount, posted.balance),
            Err(e) => return guard.settle(Settlement::from_error(&e)).await,
        }

        let handler_request = HandlerRequest {
            user,
            plan,
            request_id: ctx.request_id.clone(),
            quantity,
            body: req.body,
        };
        let budget = deadline
            .remaining()
            .map_or(parts.settings.handler_timeout, |left| {
                left.min(parts.settings.handler_timeout)
            });
        let handler_started = Instant::now();
        let outcome = tokio::time::timeout(
            budget,
            AssertUnwindSafe(handler.call(handler_request)).catch_unwind(),
        )
        .await;
        ctx.handler_time = Some(handler_started.elapsed());

        let settlement = match outcome {
            Ok(Ok(Ok(resp))) if (200..300).contains(&resp.status) => {
                Settlement::Success { status: resp.status, body: resp.body }
            }
            Ok(Ok(Ok(resp))) => Settlement::Failure {
                status: resp.status,
                body: resp.body.to_string(),
                error: format!("handler answered {}", resp.status),
                refundable: true,
            },
            Ok(Ok(Err(e))) => Settlement::from_error(&handler_error(e)),
            Ok(Err(_)) => {
                error!(target: "metered::envelope", endpoint = %route.name, "handler panicked");
                Settlement::from_error(&MeterError::Internal("handler panicked".into()))
            }
            Err(_) => {
                warn!(
                    target: "metered::envelope",
                    endpoint = %route.name,
                    ?budget,
                    "handler timed out"
                );
                Settlement::from_error(&MeterError::BusinessFailure {
                    status: 504,
                    message: "handler timed out".into(),
                })
            }
        };
        guard.settle(settlement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::clock::ManualClock;
    use crate::config::RateLimitConfig;
    use crate::identity::{Credential, TrustedIdentity};
    use crate::model::TransactionType;
    use crate::pubsub::InMemoryPubSub;
    use crate::retry::{InstantSleeper, RetryPolicy};
    use crate::store::MemoryStore;
    use crate::tariff::TariffRegistry;
    use http::Method;

    struct Fixture {
        store: Arc<MemoryStore>,
        envelope: Envelope,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let pubsub = Arc::new(InMemoryPubSub::new());
        let cache = Arc::new(InMemoryCache::new(clock.clone()));
        let tariffs = Arc::new(TariffRegistry::new(
            store.clone(),
            pubsub.clone(),
            clock.clone(),
            Duration::from_secs(300),
        ));
        let plans = Arc::new(PlanRegistry::new(
            store.clone(),
            pubsub,
            clock.clone(),
            Duration::from_secs(30),
        ));
        let ledger = Arc::new(TokenLedger::new(
            store.clone(),
            tariffs,
            clock.clone(),
            RetryPolicy::default().with_sleeper(Arc::new(InstantSleeper)),
            Duration::ZERO,
        ));
        let envelope = Envelope::new(EnvelopeParts {
            identity: Arc::new(TrustedIdentity),
            plans,
            limiter: Arc::new(AdmissionLimiter::new(
                &RateLimitConfig::default(),
                None,
                clock.clone(),
            )),
            idempotency: Arc::new(IdempotencyKeeper::new(
                store.clone(),
                cache,
                clock.clone(),
                Duration::from_secs(7 * 86_400),
                Duration::from_secs(600),
            )),
            ledger,
            audit: store.clone(),
            clock,
            settings: EnvelopeSettings::default(),
        });
        Fixture { store, envelope }
    }

    fn route() -> Arc<Route> {
        Route::new(
            EndpointTag::new("batchopen", "silent"),
            Method::POST,
            "/v1/batchopen/silent",
            "batchopen.silent",
        )
    }

    fn call(user: &str) -> MeteredRequest {
        MeteredRequest::new(route(), Credential::Verified(user.into()), json!({}))
    }

    #[tokio::test]
    async fn success_debits_and_annotates_body() {
        let f = fixture();
        f.store.seed_user("u1", 10);
        let h = handler_fn(|_| async { Ok(HandlerResponse::ok(json!({ "job": "j1" }))) });
        let resp = f.envelope.handle(call("u1"), &h).await;
        assert_eq!(resp.status, StatusCode::OK);
        let body = resp.body_json();
        assert_eq!(body["job"], "j1");
        assert_eq!(body["consumed"], 2);
        assert_eq!(body["balance"], 8);
        assert_eq!(resp.header("x-tokens-consumed"), Some("2"));
        assert!(resp.header("x-request-id").is_some());
        assert!(resp.header("server-timing").unwrap().starts_with("total;dur="));
    }

    #[tokio::test]
    async fn upstream_failure_refunds() {
        let f = fixture();
        f.store.seed_user("u1", 10);
        let h = handler_fn(|_| async {
            Err(HandlerError::Upstream { status: 502, message: "down".into() })
        });
        let resp = f.envelope.handle(call("u1"), &h).await;
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(resp.header("x-tokens-consumed"), Some("0"));
        assert_eq!(f.store.balance_of(&"u1".into()), Some(10));
        assert_eq!(f.store.ledger_sum(&"u1".into()), 10);
    }

    #[tokio::test]
    async fn validation_error_in_handler_is_not_refunded() {
        let f = fixture();
        f.store.seed_user("u1", 10);
        let h = handler_fn(|_| async { Err(HandlerError::Validation("bad url".into())) });
        let resp = f.envelope.handle(call("u1"), &h).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(f.store.balance_of(&"u1".into()), Some(8));
    }

    #[tokio::test]
    async fn upstream_client_status_is_still_refunded() {
        let f = fixture();
        f.store.seed_user("u1", 100);
        let h = handler_fn(|_| async {
            Err(HandlerError::Upstream { status: 429, message: "provider throttled".into() })
        })
        .with_quantity(array_len("domains", 5));
        let body = json!({ "domains": ["a.com", "b.com", "c.com"] });
        let req = MeteredRequest::new(route(), Credential::Verified("u1".into()), body);
        let resp = f.envelope.handle(req, &h).await;
        assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.header("x-tokens-consumed"), Some("0"));
        assert_eq!(f.store.balance_of(&"u1".into()), Some(100));

        let rows = f.store.ledger_rows(&"u1".into());
        let refund = rows.iter().find(|tx| tx.kind == TransactionType::Refund).unwrap();
        assert_eq!(refund.amount, 6);
        assert!(f.store.audit_events().iter().any(|e| e.action == AuditAction::Refund));
    }

    #[tokio::test]
    async fn panic_is_contained_and_refunded() {
        let f = fixture();
        f.store.seed_user("u1", 10);
        let h = handler_fn(|_| async {
            if true {
                panic!("boom");
            }
            Ok::<_, HandlerError>(HandlerResponse::ok(json!({})))
        });
        let resp = f.envelope.handle(call("u1"), &h).await;
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(f.store.balance_of(&"u1".into()), Some(10));
    }

    #[tokio::test]
    async fn unknown_and_disabled_users() {
        let f = fixture();
        let h = handler_fn(|_| async { Ok(HandlerResponse::ok(json!({}))) });
        let resp = f.envelope.handle(call("ghost"), &h).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
        f.store.seed_user("u2", 10);
        f.store.set_user_status(&"u2".into(), UserStatus::Disabled);
        let resp = f.envelope.handle(call("u2"), &h).await;
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
        assert_eq!(f.store.balance_of(&"u2".into()), Some(10));
    }

    #[tokio::test]
    async fn quantity_errors_charge_nothing() {
        let f = fixture();
        f.store.seed_user("u1", 10);
        let h = handler_fn(|_| async { Ok(HandlerResponse::ok(json!({}))) })
            .with_quantity(array_len("urls", 5));
        let resp = f.envelope.handle(call("u1"), &h).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(f.store.balance_of(&"u1".into()), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_is_504_and_refunded() {
        let f = fixture();
        f.store.seed_user("u1", 10);
        let h = handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HandlerResponse::ok(json!({})))
        });
        let resp = f.envelope.handle(call("u1"), &h).await;
        assert_eq!(resp.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(f.store.balance_of(&"u1".into()), Some(10));
    }
}
