use http::{HeaderMap, HeaderValue, StatusCode};
use metered_core::model::UserId;
use metered_core::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};

const SECRET: &[u8] = b"layer-test-secret";

fn route() -> Arc<Route> {
    Route::new(
        EndpointTag::new("batchopen", "silent"),
        http::Method::POST,
        "/v1/batchopen/silent",
        "batchopen.silent",
    )
}

struct Setup {
    store: Arc<MemoryStore>,
    jwt: Arc<JwtIdentity>,
    service: MeteredService,
}

fn setup() -> Setup {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let jwt = Arc::new(JwtIdentity::new(SECRET, clock.clone()));
    let core = MeteredCore::builder(MeterConfig::default())
        .clock(clock.clone())
        .backends(Backends::in_memory(store.clone(), clock))
        .identity(jwt.clone())
        .build()
        .unwrap();
    let opener = service_fn(|req: HandlerRequest| async move {
        let body = json!({ "opened": req.quantity, "user": req.user.to_string() });
        Ok::<_, HandlerError>(HandlerResponse::ok(body))
    });
    let service = ServiceBuilder::new()
        .layer(MeteredLayer::new(core.envelope().clone()).with_quantity(array_len("urls", 50)))
        .service(opener);
    Setup { store, jwt, service }
}

fn headers(token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
        headers.insert("authorization", HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
    }
    headers.insert("x-request-id", HeaderValue::from_static("req-77"));
    headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
    headers.insert("idempotency-key", HeaderValue::from_static("open-1"));
    headers
}

#[tokio::test]
async fn bearer_token_flows_through_layer() {
    let s = setup();
    s.store.seed_user("u1", 20);
    let token = s.jwt.issue(&UserId::from("u1"), None, Duration::from_secs(600)).unwrap();
    let req = MeteredRequest::from_headers(
        route(),
        &headers(Some(&token)),
        None,
        json!({ "urls": ["https://a.example", "https://b.example"] }),
    );

    let resp = s.service.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    let body = resp.body_json();
    assert_eq!(body["opened"], 2);
    assert_eq!(body["user"], "u1");
    // batchopen.silent costs 2 per URL.
    assert_eq!(body["consumed"], 4);
    assert_eq!(resp.header("x-request-id"), Some("req-77"));
    assert_eq!(s.store.balance_of(&"u1".into()), Some(16));

    let audit = s.store.audit_events();
    let last = audit.last().expect("audit row");
    assert_eq!(last.actor, "u1");
    assert_eq!(last.ip.as_deref(), Some("203.0.113.9"));
    assert!(last.ok);
}

#[tokio::test]
async fn missing_or_forged_credentials_are_401() {
    let s = setup();
    s.store.seed_user("u1", 20);
    let body = json!({ "urls": ["https://a.example"] });

    let anonymous = MeteredRequest::from_headers(route(), &headers(None), None, body.clone());
    let resp = s.service.clone().oneshot(anonymous).await.unwrap();
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(resp.body_json(), json!({ "code": 401, "message": "unauthorized" }));

    let forged = MeteredRequest::from_headers(route(), &headers(Some("not.a.jwt")), None, body);
    let resp = s.service.clone().oneshot(forged).await.unwrap();
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(s.store.balance_of(&"u1".into()), Some(20));
}
