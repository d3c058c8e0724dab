//! Walkthrough: a batch rank lookup billed per domain, its idempotent
//! replay, an insufficient balance, and a refunded upstream failure.
use metered_core::model::UserId;
use metered_core::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn route() -> Arc<Route> {
    Route::new(
        EndpointTag::new("siterank", "query"),
        http::Method::POST,
        "/v1/siterank/batch:execute",
        "siterank.batch",
    )
}

fn batch(user: &str, key: &str) -> MeteredRequest {
    MeteredRequest::new(
        route(),
        Credential::Verified(user.into()),
        json!({ "domains": ["a.com", "b.com", "c.com"] }),
    )
    .with_idempotency_key(key)
}

fn show(label: &str, resp: &MeteredResponse) {
    let replay = resp.header("x-idempotent-replay").unwrap_or("false");
    println!("{label}: {} replay={replay} body={}", resp.status, resp.body);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(true).init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    store.seed_user("u1", 100);
    store.seed_user("u2", 2);
    store.seed_user("u3", 100);

    let core = MeteredCore::builder(MeterConfig::default())
        .clock(clock.clone())
        .backends(Backends::in_memory(store.clone(), clock))
        .build()?;
    core.start().await?;

    let ranker = handler_fn(|req: HandlerRequest| async move {
        let results: Vec<_> = req.body["domains"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|d| json!({ "domain": d, "global_rank": 1_000 }))
            .collect();
        Ok(HandlerResponse::ok(json!({ "results": results })))
    })
    .with_quantity(array_len("domains", 100));
    let broken = handler_fn(|_req: HandlerRequest| async {
        Err(HandlerError::Upstream { status: 502, message: "similarweb timed out".into() })
    })
    .with_quantity(array_len("domains", 100));

    show("first call", &core.envelope().handle(batch("u1", "K1"), &ranker).await);
    show("replay", &core.envelope().handle(batch("u1", "K1"), &ranker).await);
    show("low balance", &core.envelope().handle(batch("u2", "K2"), &ranker).await);
    show("upstream failure", &core.envelope().handle(batch("u3", "K3"), &broken).await);

    for user in ["u1", "u2", "u3"] {
        let id = UserId::from(user);
        let history = core.ledger().history(&id).await?;
        let balance = core.ledger().balance(&id).await?;
        println!("{user}: balance={balance} ledger_rows={}", history.len());
    }

    core.shutdown().await;
    Ok(())
}
