#![allow(dead_code)]

use metered_core::prelude::*;
use metered_core::config::Quota;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub pubsub: Arc<InMemoryPubSub>,
    pub core: MeteredCore,
}

/// Core over an in-memory store with a manual clock.
pub fn harness(config: MeterConfig) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    harness_on(config, clock, store, Arc::new(InMemoryPubSub::new()))
}

/// A replica sharing `store` and `pubsub` with other harnesses.
pub fn harness_on(
    config: MeterConfig,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    pubsub: Arc<InMemoryPubSub>,
) -> Harness {
    let mut backends = Backends::in_memory(store.clone(), clock.clone());
    backends.pubsub = pubsub.clone();
    let core = MeteredCore::builder(config)
        .clock(clock.clone())
        .backends(backends)
        .build()
        .expect("valid config");
    Harness { clock, store, pubsub, core }
}

/// Config whose plan quotas never get in the way.
pub fn roomy_config() -> MeterConfig {
    let mut config = MeterConfig::default();
    for quota in config.rate_limit.plans.values_mut() {
        *quota = Quota::new(10_000.0, 10_000);
    }
    config
}

pub fn siterank_route() -> Arc<Route> {
    Route::new(
        EndpointTag::new("siterank", "query"),
        http::Method::POST,
        "/v1/siterank/batch:execute",
        "siterank.batch",
    )
}

pub fn batch_request(user: &str, domains: &[&str], key: Option<&str>) -> MeteredRequest {
    let req = MeteredRequest::new(
        siterank_route(),
        Credential::Verified(user.into()),
        json!({ "domains": domains }),
    );
    match key {
        Some(k) => req.with_idempotency_key(k),
        None => req,
    }
}

/// Rank lookup that counts its invocations.
pub fn ranking_handler(calls: Arc<AtomicUsize>) -> impl BusinessHandler {
    handler_fn(move |req: HandlerRequest| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let results: Vec<Value> = req.body["domains"]
                .as_array()
                .into_iter()
                .flatten()
                .map(|d| json!({ "domain": d, "rank": 42 }))
                .collect();
            Ok(HandlerResponse::ok(json!({ "results": results })))
        }
    })
    .with_quantity(array_len("domains", 100))
}

/// Rank lookup whose upstream always times out.
pub fn failing_handler(calls: Arc<AtomicUsize>) -> impl BusinessHandler {
    handler_fn(move |_req: HandlerRequest| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Upstream { status: 502, message: "similarweb timed out".into() })
        }
    })
    .with_quantity(array_len("domains", 100))
}
