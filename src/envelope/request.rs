use crate::identity::Credential;
use crate::model::UserId;
use http::{HeaderMap, Method};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// `(service, action)` pair a route is priced under. Fixed at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointTag {
    pub service: &'static str,
    pub action: &'static str,
}

impl EndpointTag {
    pub const fn new(service: &'static str, action: &'static str) -> Self {
        Self { service, action }
    }
}

impl fmt::Display for EndpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.action)
    }
}

/// A registered metered route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub tag: EndpointTag,
    pub method: Method,
    pub path: String,
    /// Stable endpoint name: idempotency scope and ledger `ref_id`.
    pub name: String,
}

impl Route {
    pub fn new(
        tag: EndpointTag,
        method: Method,
        path: impl Into<String>,
        name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self { tag, method, path: path.into(), name: name.into() })
    }
}

/// One inbound metered call.
#[derive(Clone, Debug)]
pub struct MeteredRequest {
    pub route: Arc<Route>,
    pub credential: Credential,
    /// Raw `Idempotency-Key`, validated during admission.
    pub idempotency_key: Option<String>,
    pub request_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub body: JsonValue,
    /// Time left on the caller's deadline.
    pub budget: Option<Duration>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

impl MeteredRequest {
    pub fn new(route: Arc<Route>, credential: Credential, body: JsonValue) -> Self {
        Self {
            route,
            credential,
            idempotency_key: None,
            request_id: None,
            ip: None,
            user_agent: None,
            body,
            budget: None,
        }
    }

    /// Populate credential and metadata from request headers. A user id
    /// already verified upstream wins over the `Authorization` header.
    pub fn from_headers(
        route: Arc<Route>,
        headers: &HeaderMap,
        verified: Option<UserId>,
        body: JsonValue,
    ) -> Self {
        let credential = match verified {
            Some(user) => Credential::Verified(user),
            None => match header_str(headers, "authorization") {
                Some(auth) => match auth.split_once(' ') {
                    Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
                        Credential::Bearer(token.trim().to_string())
                    }
                    _ => Credential::Anonymous,
                },
                None => Credential::Anonymous,
            },
        };
        let ip = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .or_else(|| header_str(headers, "x-real-ip").map(str::to_string));
        Self {
            route,
            credential,
            idempotency_key: headers
                .get("idempotency-key")
                .and_then(|v| v.to_str().ok().map(str::to_string)),
            request_id: header_str(headers, "x-request-id").map(str::to_string),
            ip,
            user_agent: header_str(headers, "user-agent").map(str::to_string),
            body,
            budget: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn route() -> Arc<Route> {
        Route::new(
            EndpointTag::new("siterank", "query"),
            Method::POST,
            "/v1/siterank/batch:execute",
            "siterank.batch",
        )
    }

    #[test]
    fn reads_bearer_and_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def.ghi"));
        headers.insert("idempotency-key", HeaderValue::from_static("K1"));
        headers.insert("x-request-id", HeaderValue::from_static("req-7"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8"));
        let req = MeteredRequest::from_headers(route(), &headers, None, JsonValue::Null);
        assert_eq!(req.credential, Credential::Bearer("abc.def.ghi".into()));
        assert_eq!(req.idempotency_key.as_deref(), Some("K1"));
        assert_eq!(req.request_id.as_deref(), Some("req-7"));
        assert_eq!(req.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(req.user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn verified_user_wins_and_missing_auth_is_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        let req =
            MeteredRequest::from_headers(route(), &headers, Some("u1".into()), JsonValue::Null);
        assert_eq!(req.credential, Credential::Verified("u1".into()));
        let anon = MeteredRequest::from_headers(route(), &HeaderMap::new(), None, JsonValue::Null);
        assert_eq!(anon.credential, Credential::Anonymous);
    }

    #[test]
    fn tag_display() {
        assert_eq!(EndpointTag::new("batchopen", "silent").to_string(), "batchopen.silent");
    }
}
