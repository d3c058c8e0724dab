use crate::model::{PlanName, UserId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tower::{Service, ServiceExt};

/// What the business handler sees once admission has passed.
#[derive(Clone, Debug)]
pub struct HandlerRequest {
    pub user: UserId,
    pub plan: PlanName,
    pub request_id: String,
    pub quantity: u32,
    pub body: JsonValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl HandlerResponse {
    pub fn ok(body: JsonValue) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: JsonValue) -> Self {
        Self { status, body }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The request body is unusable. Not refunded.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A downstream dependency failed with `status`.
    #[error("upstream failed ({status}): {message}")]
    Upstream { status: u16, message: String },
    #[error("internal: {0}")]
    Internal(String),
}

/// The metered business operation behind a route.
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    /// Billable units in `body`. Runs before any debit; a validation error
    /// here is a 400 with nothing charged.
    fn quantity(&self, _body: &JsonValue) -> Result<u32, HandlerError> {
        Ok(1)
    }

    async fn call(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError>;
}

pub(super) type QuantityFn = Arc<dyn Fn(&JsonValue) -> Result<u32, HandlerError> + Send + Sync>;
type HandlerFuture = BoxFuture<'static, Result<HandlerResponse, HandlerError>>;
type CallFn = Arc<dyn Fn(HandlerRequest) -> HandlerFuture + Send + Sync>;

/// Closure-backed handler.
#[derive(Clone)]
pub struct FnHandler {
    call: CallFn,
    quantity: Option<QuantityFn>,
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("quantity", &self.quantity.is_some()).finish()
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<HandlerResponse, HandlerError>> + Send + 'static,
{
    let call: CallFn = Arc::new(move |req| -> HandlerFuture { Box::pin(f(req)) });
    FnHandler { call, quantity: None }
}

impl FnHandler {
    pub fn with_quantity<Q>(mut self, q: Q) -> Self
    where
        Q: Fn(&JsonValue) -> Result<u32, HandlerError> + Send + Sync + 'static,
    {
        self.quantity = Some(Arc::new(q));
        self
    }
}

#[async_trait]
impl BusinessHandler for FnHandler {
    fn quantity(&self, body: &JsonValue) -> Result<u32, HandlerError> {
        match &self.quantity {
            Some(q) => q(body),
            None => Ok(1),
        }
    }

    async fn call(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
        (self.call)(request).await
    }
}

/// Adapts a tower service into a [`BusinessHandler`].
#[derive(Clone)]
pub struct ServiceHandler<S> {
    service: S,
    pub(super) quantity: Option<QuantityFn>,
}

impl<S> ServiceHandler<S> {
    pub fn new(service: S) -> Self {
        Self { service, quantity: None }
    }

    pub fn with_quantity<Q>(mut self, q: Q) -> Self
    where
        Q: Fn(&JsonValue) -> Result<u32, HandlerError> + Send + Sync + 'static,
    {
        self.quantity = Some(Arc::new(q));
        self
    }
}

#[async_trait]
impl<S> BusinessHandler for ServiceHandler<S>
where
    S: Service<HandlerRequest, Response = HandlerResponse, Error = HandlerError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    fn quantity(&self, body: &JsonValue) -> Result<u32, HandlerError> {
        match &self.quantity {
            Some(q) => q(body),
            None => Ok(1),
        }
    }

    async fn call(&self, request: HandlerRequest) -> Result<HandlerResponse, HandlerError> {
        self.service.clone().oneshot(request).await
    }
}

/// Count of a non-empty array field, the common quantity rule for batch
/// endpoints.
pub fn array_len(
    field: &'static str,
    max: usize,
) -> impl Fn(&JsonValue) -> Result<u32, HandlerError> + Send + Sync {
    move |body| {
        let items = body
            .get(field)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| HandlerError::Validation(format!("`{field}` must be an array")))?;
        if items.is_empty() {
            return Err(HandlerError::Validation(format!("`{field}` must not be empty")));
        }
        if items.len() > max {
            return Err(HandlerError::Validation(format!("`{field}` has more than {max} items")));
        }
        u32::try_from(items.len())
            .map_err(|_| HandlerError::Validation(format!("`{field}` too large")))
    }
}
