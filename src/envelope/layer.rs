use super::handler::QuantityFn;
use super::{
    BusinessHandler, Envelope, HandlerError, HandlerRequest, HandlerResponse, MeteredRequest,
    MeteredResponse, ServiceHandler,
};
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Wraps a business service in the admission envelope.
#[derive(Clone)]
pub struct MeteredLayer {
    envelope: Envelope,
    quantity: Option<QuantityFn>,
}

impl std::fmt::Debug for MeteredLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredLayer").field("envelope", &self.envelope).finish_non_exhaustive()
    }
}

impl MeteredLayer {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope, quantity: None }
    }

    /// Billable units per request; defaults to 1.
    pub fn with_quantity<Q>(mut self, q: Q) -> Self
    where
        Q: Fn(&JsonValue) -> Result<u32, HandlerError> + Send + Sync + 'static,
    {
        self.quantity = Some(Arc::new(q));
        self
    }
}

impl<S> Layer<S> for MeteredLayer
where
    S: Service<HandlerRequest, Response = HandlerResponse, Error = HandlerError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    type Service = MeteredService;

    fn layer(&self, service: S) -> Self::Service {
        let mut handler = ServiceHandler::new(service);
        handler.quantity = self.quantity.clone();
        MeteredService::new(self.envelope.clone(), Arc::new(handler))
    }
}

/// Service form of [`Envelope::handle`]. Every outcome, including
/// rejections, is a response.
#[derive(Clone)]
pub struct MeteredService {
    envelope: Envelope,
    handler: Arc<dyn BusinessHandler>,
}

impl std::fmt::Debug for MeteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredService").field("envelope", &self.envelope).finish_non_exhaustive()
    }
}

impl MeteredService {
    pub fn new(envelope: Envelope, handler: Arc<dyn BusinessHandler>) -> Self {
        Self { envelope, handler }
    }
}

impl Service<MeteredRequest> for MeteredService {
    type Response = MeteredResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<MeteredResponse, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: MeteredRequest) -> Self::Future {
        let envelope = self.envelope.clone();
        let handler = self.handler.clone();
        Box::pin(async move { Ok(envelope.handle(req, handler.as_ref()).await) })
    }
}
