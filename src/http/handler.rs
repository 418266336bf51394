//! The request-handling capability and its adapters.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use http::{Request, Response, StatusCode};
use tower::{Service, ServiceExt};

use super::body::{self, Body, BoxError};

/// Failure of a single request.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Drop the request without writing a response.
    #[error("request aborted")]
    Abort,

    #[error("handler failed: {0}")]
    Failed(#[source] BoxError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

pub type HandlerFuture = BoxFuture<'static, Result<Response<Body>, HandlerError>>;

/// Handles requests from every protocol engine.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request<Body>) -> HandlerFuture;
}

/// Build a handler from an async function.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, HandlerError>> + Send + 'static,
{
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        Box::pin((self.0)(req))
    }
}

/// Adapt a `tower` service, such as `tower_http::services::ServeDir`.
pub fn from_service<S, B>(service: S) -> Arc<dyn Handler>
where
    S: Service<Request<Body>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    Arc::new(ServiceHandler(service))
}

struct ServiceHandler<S>(S);

impl<S, B> Handler for ServiceHandler<S>
where
    S: Service<Request<Body>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        let service = self.0.clone();
        Box::pin(service.oneshot(req).map(|result| {
            result
                .map(|res| res.map(body::boxed))
                .map_err(|e| HandlerError::Failed(e.into()))
        }))
    }
}

/// Answers every request with `404 Not Found`. Used when no handler is set.
pub fn not_found() -> Arc<dyn Handler> {
    Arc::new(NotFound)
}

struct NotFound;

impl Handler for NotFound {
    fn call(&self, _req: Request<Body>) -> HandlerFuture {
        let mut res = Response::new(body::empty());
        *res.status_mut() = StatusCode::NOT_FOUND;
        Box::pin(future::ready(Ok(res)))
    }
}
