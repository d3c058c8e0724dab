#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # metered-core
//!
//! Admission core for metered API endpoints: every billable call passes
//! through one envelope that resolves the caller's plan, rate-limits,
//! deduplicates by idempotency key, debits tokens, runs the business
//! handler and refunds on failure.
//!
//! ## Components
//!
//! - **Tariffs** ([`tariff`]): `(service, action)` → tokens per unit.
//! - **Plans** ([`plan`]): active plan per user and subscription lifecycle.
//! - **Rate limiting** ([`rate_limit`]): token buckets in process or a
//!   sliding window over a shared cache, per scope.
//! - **Idempotency** ([`idempotency`]): at-most-once execution per key.
//! - **Ledger** ([`ledger`]): atomic debits, credits and refunds.
//! - **Envelope** ([`envelope`]): the admission protocol and its tower layer.
//! - **Config bus** ([`bus`]): hot reload from file and pub/sub.
//! - **Jobs** ([`jobs`]): expiry, GC, orphan reconciliation, reminders.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metered_core::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::default());
//!     store.seed_user("u1", 100);
//!     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//!     let core = MeteredCore::builder(MeterConfig::default())
//!         .backends(Backends::in_memory(store, clock))
//!         .build()?;
//!     core.start().await?;
//!
//!     let route = Route::new(
//!         EndpointTag::new("siterank", "query"),
//!         http::Method::POST,
//!         "/v1/siterank/batch:execute",
//!         "siterank.batch",
//!     );
//!     let handler = handler_fn(|req: HandlerRequest| async move {
//!         Ok(HandlerResponse::ok(json!({ "results": req.body["domains"] })))
//!     })
//!     .with_quantity(array_len("domains", 100));
//!     let request = MeteredRequest::new(
//!         route,
//!         Credential::Verified("u1".into()),
//!         json!({ "domains": ["a.com", "b.com"] }),
//!     )
//!     .with_idempotency_key("K1");
//!     let response = core.envelope().handle(request, &handler).await;
//!     assert_eq!(response.status, http::StatusCode::OK);
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod audit;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod deadline;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod idempotency;
pub mod jobs;
pub mod ledger;
pub mod model;
pub mod plan;
pub mod prelude;
pub mod pubsub;
pub mod rate_limit;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod tariff;

// Re-exports
pub use app::{Backends, MeteredCore, MeteredCoreBuilder};
pub use audit::{AuditAction, AuditEvent, AuditSink, FanoutAuditSink, TracingAuditSink};
pub use bus::{ConfigBus, ConfigEvent, ConfigListener};
pub use cache::{InMemoryCache, SharedCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MeterConfig, Quota};
pub use envelope::{Envelope, MeteredLayer, MeteredRequest, MeteredResponse, MeteredService};
pub use error::{ErrorKind, MeterError, StoreError};
pub use idempotency::IdempotencyKeeper;
pub use ledger::TokenLedger;
pub use plan::PlanRegistry;
pub use pubsub::{InMemoryPubSub, PubSub};
pub use rate_limit::{AdmissionLimiter, Decision, RateLimiter};
pub use retry::{Backoff, RetryPolicy};
pub use tariff::TariffRegistry;
