//! Convenient re-exports for common metered-core types.
pub use crate::{
    app::{Backends, MeteredCore, MeteredCoreBuilder},
    audit::{AuditAction, AuditEvent, AuditSink},
    bus::{ConfigBus, ConfigEvent, ConfigListener},
    cache::{InMemoryCache, SharedCache},
    clock::{Clock, ManualClock, SystemClock},
    config::{MeterConfig, Quota, RateLimitConfig},
    envelope::{
        array_len, handler_fn, BusinessHandler, EndpointTag, Envelope, HandlerError,
        HandlerRequest, HandlerResponse, MeteredLayer, MeteredRequest, MeteredResponse,
        MeteredService, Route, ServiceHandler,
    },
    error::{MeterError, StoreError},
    identity::{Credential, IdentityResolver, JwtIdentity, TrustedIdentity},
    ledger::{LedgerRef, TokenLedger},
    model::{PlanName, TransactionType, UserId},
    pubsub::{InMemoryPubSub, PubSub},
    rate_limit::{AdmissionLimiter, Decision},
    store::MemoryStore,
};
