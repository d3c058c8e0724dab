#[path = "common/test_helpers.rs"]
mod test_helpers;

use futures::future::join_all;
use metered_core::config::Quota;
use metered_core::ledger::LedgerRef;
use metered_core::model::{TransactionType, UserId};
use metered_core::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_overdraw() {
    let h = harness(roomy_config());
    h.store.seed_user("u1", 50);
    let handler: Arc<dyn BusinessHandler> =
        Arc::new(ranking_handler(Arc::new(AtomicUsize::new(0))));
    let u1 = UserId::from("u1");

    let tasks = (0..40).map(|i| {
        let envelope = h.core.envelope().clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let req = batch_request("u1", &["a.com", "b.com", "c.com"], None)
                .with_request_id(format!("r{i}"));
            envelope.handle(req, handler.as_ref()).await.status
        })
    });
    let statuses: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let ok = statuses.iter().filter(|s| **s == http::StatusCode::OK).count();
    let poor = statuses.iter().filter(|s| **s == http::StatusCode::PAYMENT_REQUIRED).count();
    assert_eq!(ok + poor, 40);
    assert_eq!(ok, 16);
    let balance = h.store.balance_of(&u1).unwrap();
    assert_eq!(balance, 2);
    assert_eq!(h.store.ledger_sum(&u1), balance);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_runs_handler_at_most_once() {
    let h = harness(roomy_config());
    h.store.seed_user("u1", 100);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow: Arc<dyn BusinessHandler> = Arc::new(
        handler_fn(move |_req: HandlerRequest| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(HandlerResponse::ok(json!({ "results": [] })))
            }
        })
        .with_quantity(array_len("domains", 100)),
    );

    let tasks = (0..20).map(|_| {
        let envelope = h.core.envelope().clone();
        let slow = slow.clone();
        tokio::spawn(async move {
            let req = batch_request("u1", &["a.com", "b.com"], Some("K-race"));
            let resp = envelope.handle(req, slow.as_ref()).await;
            (resp.status, resp.body_json())
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|(status, _)| *status == http::StatusCode::OK));
    let duplicates = results.iter().filter(|(_, body)| body["duplicate"] == true).count();
    assert!(duplicates >= 1);
    assert_eq!(h.store.balance_of(&"u1".into()), Some(98));
}

#[tokio::test]
async fn every_failed_debit_has_one_matching_refund() {
    let h = harness(roomy_config());
    h.store.seed_user("u1", 100);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = handler_fn(move |_req: HandlerRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n % 2 == 0 {
                Ok(HandlerResponse::ok(json!({})))
            } else {
                Err(HandlerError::Upstream { status: 503, message: "busy".into() })
            }
        }
    })
    .with_quantity(array_len("domains", 100));

    for i in 0..6 {
        let req = batch_request("u1", &["a.com", "b.com"], Some(&format!("K{i}")));
        h.core.envelope().handle(req, &flaky).await;
    }

    let u1 = UserId::from("u1");
    let history = h.core.ledger().history(&u1).await.unwrap();
    let consumes: Vec<_> =
        history.iter().filter(|tx| tx.kind == TransactionType::Consume).collect();
    let refunds: Vec<_> = history.iter().filter(|tx| tx.kind == TransactionType::Refund).collect();
    assert_eq!(consumes.len(), 6);
    assert_eq!(refunds.len(), 3);
    for refund in &refunds {
        let key = &refund.details["idempotency_key"];
        let matching = consumes.iter().filter(|c| c.details["idempotency_key"] == *key).count();
        assert_eq!(matching, 1);
        assert_eq!(refund.amount, 2);
        assert_eq!(refund.ref_id, "siterank.batch");
    }
    assert_eq!(h.store.balance_of(&u1), Some(94));
    assert_eq!(h.store.ledger_sum(&u1), 94);
}

#[tokio::test]
async fn credit_then_debit_nets_to_zero() {
    let h = harness(MeterConfig::default());
    h.store.seed_user("u1", 10);
    let u1 = UserId::from("u1");
    let ledger = h.core.ledger();
    let before = h.core.ledger().history(&u1).await.unwrap().len();

    ledger.credit(&u1, 25, TransactionType::Purchase, &LedgerRef::new("order-7")).await.unwrap();
    ledger.consume_exact(&u1, 25, "admin", "reverse", &LedgerRef::new("order-7")).await.unwrap();

    let rows = ledger.find_by_ref(&u1, "order-7").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().map(|r| r.amount).sum::<i64>(), 0);
    assert_eq!(ledger.history(&u1).await.unwrap().len(), before + 2);
    assert_eq!(h.store.balance_of(&u1), Some(10));
}

#[tokio::test]
async fn boundary_requests() {
    let h = harness(roomy_config());
    h.store.seed_user("u1", 100);
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = ranking_handler(calls.clone());

    // qty = 0
    let resp = h.core.envelope().handle(batch_request("u1", &[], None), &handler).await;
    assert_eq!(resp.status, http::StatusCode::BAD_REQUEST);

    // Unpriced endpoint is a hard 400, never free.
    let ghost = Route::new(
        EndpointTag::new("ghost", "scan"),
        http::Method::POST,
        "/v1/ghost/scan",
        "ghost.scan",
    );
    let body = json!({ "domains": ["a.com"] });
    let req = MeteredRequest::new(ghost, Credential::Verified("u1".into()), body);
    let resp = h.core.envelope().handle(req, &handler).await;
    assert_eq!(resp.status, http::StatusCode::BAD_REQUEST);
    assert_eq!(resp.body_json()["message"], "unknown_endpoint");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Empty key: both calls execute.
    for _ in 0..2 {
        let req = batch_request("u1", &["a.com"], Some(""));
        let resp = h.core.envelope().handle(req, &handler).await;
        assert_eq!(resp.status, http::StatusCode::OK);
        assert!(resp.header("x-idempotent-replay").is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(h.store.idempotency_rows().is_empty());
    assert_eq!(h.store.balance_of(&"u1".into()), Some(98));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_respect_bucket_limit() {
    let mut config = MeterConfig::default();
    config.rate_limit.plans.insert("FREE".into(), Quota::new(0.001, 5));
    let h = harness(config);
    h.store.seed_user("u1", 1_000);
    let handler: Arc<dyn BusinessHandler> =
        Arc::new(ranking_handler(Arc::new(AtomicUsize::new(0))));

    let tasks = (0..30).map(|_| {
        let envelope = h.core.envelope().clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let req = batch_request("u1", &["a.com"], None);
            envelope.handle(req, handler.as_ref()).await.status
        })
    });
    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|s| *s.as_ref().unwrap() == http::StatusCode::OK)
        .count();
    assert_eq!(admitted, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_respect_window_limit() {
    let mut config = MeterConfig::default();
    config.rate_limit.use_shared_store = true;
    // ceil(0.1 * 60) = 6 per window
    config.rate_limit.plans.insert("FREE".into(), Quota::new(0.1, 1));
    let h = harness(config);
    h.store.seed_user("u1", 1_000);
    let handler: Arc<dyn BusinessHandler> =
        Arc::new(ranking_handler(Arc::new(AtomicUsize::new(0))));

    let tasks = (0..20).map(|_| {
        let envelope = h.core.envelope().clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let req = batch_request("u1", &["a.com"], None);
            envelope.handle(req, handler.as_ref()).await.status
        })
    });
    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|s| *s.as_ref().unwrap() == http::StatusCode::OK)
        .count();
    assert_eq!(admitted, 6);
}
