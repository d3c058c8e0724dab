//! Error types for the metered core.
//!
//! Components return typed errors; only the envelope turns them into HTTP
//! statuses and client bodies. Client bodies are stable (`{code, message,
//! details?}`) and never carry backend text.
use http::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

/// Failure reported by a datastore, shared cache, or pub/sub backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached or refused the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Lock contention or deadlock; the caller may retry.
    #[error("write conflict: {0}")]
    Conflict(String),
    /// Row or key that the operation requires does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Operation is not valid for the current row state.
    #[error("invalid operation: {0}")]
    Invalid(String),
    /// Any other backend error.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transient failures worth a bounded retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

/// Coarse classification used for audit rows and status mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClientInput,
    Unauthorized,
    Forbidden,
    RateLimited,
    InsufficientTokens,
    IdempotentDuplicate,
    DependencyTimeout,
    DependencyError,
    BusinessFailure,
    Internal,
}

impl ErrorKind {
    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientInput => "client_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::InsufficientTokens => "insufficient_tokens",
            ErrorKind::IdempotentDuplicate => "idempotent_duplicate",
            ErrorKind::DependencyTimeout => "dependency_timeout",
            ErrorKind::DependencyError => "dependency_error",
            ErrorKind::BusinessFailure => "business_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Unified error type for every admission step.
#[derive(thiserror::Error, Debug, Clone)]
pub enum MeterError {
    /// Malformed request (bad quantity, bad idempotency key, ...).
    #[error("invalid request: {0}")]
    ClientInput(String),
    /// No tariff rule prices this `(service, action)`; never treated as free.
    #[error("no tariff rule for {service}.{action}")]
    TariffNotFound { service: String, action: String },
    /// Missing or invalid identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Identity valid but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Denied by the rate limiter.
    #[error("rate limited on {scope} scope (retry after {retry_after:?})")]
    RateLimited { scope: String, retry_after: Duration },
    /// Balance does not cover the price.
    #[error("insufficient tokens: required {required}, balance {balance}")]
    InsufficientTokens { required: i64, balance: i64 },
    /// Replay or in-progress duplicate.
    #[error("duplicate request")]
    IdempotentDuplicate,
    /// A store or pub/sub call ran past its deadline.
    #[error("{operation} exceeded its {timeout:?} deadline")]
    DependencyTimeout { operation: &'static str, timeout: Duration },
    /// A store or pub/sub call failed.
    #[error("dependency failure: {0}")]
    Dependency(#[from] StoreError),
    /// The business handler failed or answered non-2xx.
    #[error("business handler failed with {status}: {message}")]
    BusinessFailure { status: u16, message: String },
    /// Panic or invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MeterError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeterError::ClientInput(_) | MeterError::TariffNotFound { .. } => {
                ErrorKind::ClientInput
            }
            MeterError::Unauthorized(_) => ErrorKind::Unauthorized,
            MeterError::Forbidden(_) => ErrorKind::Forbidden,
            MeterError::RateLimited { .. } => ErrorKind::RateLimited,
            MeterError::InsufficientTokens { .. } => ErrorKind::InsufficientTokens,
            MeterError::IdempotentDuplicate => ErrorKind::IdempotentDuplicate,
            MeterError::DependencyTimeout { .. } => ErrorKind::DependencyTimeout,
            MeterError::Dependency(_) => ErrorKind::DependencyError,
            MeterError::BusinessFailure { .. } => ErrorKind::BusinessFailure,
            MeterError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status the envelope answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            MeterError::ClientInput(_) | MeterError::TariffNotFound { .. } => {
                StatusCode::BAD_REQUEST
            }
            MeterError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            MeterError::Forbidden(_) => StatusCode::FORBIDDEN,
            MeterError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            MeterError::InsufficientTokens { .. } => StatusCode::PAYMENT_REQUIRED,
            MeterError::IdempotentDuplicate => StatusCode::OK,
            MeterError::DependencyTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MeterError::Dependency(e) => match e {
                StoreError::Backend(_) | StoreError::NotFound(_) => StatusCode::BAD_GATEWAY,
                StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
                StoreError::Unavailable(_) | StoreError::Conflict(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
            MeterError::BusinessFailure { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            MeterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 4xx outcomes, audited as denials when nothing was debited.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// Stable client body; backend detail stays in the logs.
    pub fn body(&self) -> Value {
        let code = self.status().as_u16();
        match self {
            MeterError::ClientInput(msg) => {
                json!({ "code": code, "message": "invalid_request", "details": msg })
            }
            MeterError::TariffNotFound { service, action } => json!({
                "code": code,
                "message": "unknown_endpoint",
                "details": format!("{service}.{action}"),
            }),
            MeterError::Unauthorized(_) => json!({ "code": code, "message": "unauthorized" }),
            MeterError::Forbidden(_) => json!({ "code": code, "message": "forbidden" }),
            MeterError::RateLimited { .. } => json!({ "code": code, "message": "rate_limited" }),
            MeterError::InsufficientTokens { required, balance } => json!({
                "code": code,
                "message": "INSUFFICIENT_TOKENS",
                "required": required,
                "balance": balance,
            }),
            MeterError::IdempotentDuplicate => {
                json!({ "code": code, "duplicate": true, "message": "duplicate request" })
            }
            MeterError::DependencyTimeout { .. } => {
                json!({ "code": code, "message": "dependency_timeout" })
            }
            MeterError::Dependency(_) => json!({ "code": code, "message": "dependency_error" }),
            MeterError::BusinessFailure { message, .. } => {
                json!({ "code": code, "message": "upstream_failure", "details": message })
            }
            MeterError::Internal(_) => json!({ "code": code, "message": "internal_error" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_store_errors() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(StoreError::Conflict("deadlock".into()).is_retryable());
        assert!(!StoreError::NotFound("user u1".into()).is_retryable());
        assert!(!StoreError::Backend("syntax".into()).is_retryable());
    }

    #[test]
    fn insufficient_tokens_body_matches_contract() {
        let err = MeterError::InsufficientTokens { required: 3, balance: 2 };
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            err.body(),
            json!({"code": 402, "message": "INSUFFICIENT_TOKENS", "required": 3, "balance": 2})
        );
    }

    #[test]
    fn dependency_body_hides_backend_text() {
        let err = MeterError::from(StoreError::Backend("SELECT * FROM users failed".into()));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(!err.body().to_string().contains("SELECT"));
        assert_eq!(err.kind(), ErrorKind::DependencyError);
    }

    #[test]
    fn unknown_tariff_is_client_input() {
        let err = MeterError::TariffNotFound { service: "x".into(), action: "y".into() };
        assert_eq!(err.kind(), ErrorKind::ClientInput);
        assert!(err.is_client_error());
    }

    #[test]
    fn business_failure_passes_status_through() {
        let err = MeterError::BusinessFailure { status: 502, message: "timeout".into() };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(!err.is_client_error());
        let bogus = MeterError::BusinessFailure { status: 42, message: "?".into() };
        assert_eq!(bogus.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn rate_limited_body() {
        let err =
            MeterError::RateLimited { scope: "plan".into(), retry_after: Duration::from_secs(1) };
        assert_eq!(err.body(), json!({"code": 429, "message": "rate_limited"}));
    }
}
