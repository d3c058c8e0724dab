use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::Value as JsonValue;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");
pub const X_TOKENS_CONSUMED: HeaderName = HeaderName::from_static("x-tokens-consumed");
pub const X_TOKENS_BALANCE: HeaderName = HeaderName::from_static("x-tokens-balance");
pub const X_IDEMPOTENT_REPLAY: HeaderName = HeaderName::from_static("x-idempotent-replay");

/// What the envelope answers with. The body is kept as the exact bytes
/// stored for replay.
#[derive(Clone, Debug)]
pub struct MeteredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl MeteredResponse {
    pub fn new(status: StatusCode, body: String) -> Self {
        Self { status, headers: HeaderMap::new(), body }
    }

    pub fn json(status: StatusCode, body: &JsonValue) -> Self {
        Self::new(status, body.to_string())
    }

    /// Parsed body; `Null` if it is not JSON.
    pub fn body_json(&self) -> JsonValue {
        serde_json::from_str(&self.body).unwrap_or(JsonValue::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn set(&mut self, name: HeaderName, value: impl ToString) {
        if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
            self.headers.insert(name, v);
        }
    }
}

/// `Server-Timing` value for the recorded phases.
pub(crate) fn server_timing(phases: &[(&str, std::time::Duration)]) -> String {
    phases
        .iter()
        .map(|(name, d)| format!("{name};dur={:.1}", d.as_secs_f64() * 1_000.0))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn server_timing_format() {
        let v = server_timing(&[
            ("total", Duration::from_micros(12_340)),
            ("handler", Duration::from_millis(10)),
        ]);
        assert_eq!(v, "total;dur=12.3, handler;dur=10.0");
    }

    #[test]
    fn body_json_tolerates_garbage() {
        let r = MeteredResponse::new(StatusCode::OK, "not json".into());
        assert!(r.body_json().is_null());
        let r = MeteredResponse::json(StatusCode::OK, &serde_json::json!({"a": 1}));
        assert_eq!(r.body_json()["a"], 1);
    }
}
