//! Routes gRPC requests to a dedicated handler.

use std::sync::Arc;

use http::{header, Request, Version};

use super::body::Body;
use super::handler::{Handler, HandlerFuture};

/// HTTP/2 requests with an `application/grpc*` content type go to `grpc`,
/// everything else to `fallback`.
pub fn grpc(fallback: Arc<dyn Handler>, grpc: Arc<dyn Handler>) -> Arc<dyn Handler> {
    Arc::new(GrpcMux { fallback, grpc })
}

pub fn is_grpc_request<B>(req: &Request<B>) -> bool {
    req.version() == Version::HTTP_2
        && req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/grpc"))
}

struct GrpcMux {
    fallback: Arc<dyn Handler>,
    grpc: Arc<dyn Handler>,
}

impl Handler for GrpcMux {
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        if is_grpc_request(&req) {
            self.grpc.call(req)
        } else {
            self.fallback.call(req)
        }
    }
}
