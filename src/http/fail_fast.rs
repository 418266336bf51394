//! Treats unexpected handler failures as fatal to the server.
//!
//! A handler that panics or fails mid-request can leave shared state in a
//! condition that is unsafe to keep serving from. The wrapper logs a
//! diagnostic, records the failure, aborts the request and triggers
//! server shutdown. [`crate::Server::run`] then returns [`Error::Fatal`]
//! and the host decides whether to exit.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use http::Request;
use tokio_util::sync::CancellationToken;

use super::body::Body;
use super::handler::{Handler, HandlerError, HandlerFuture};
use crate::error::Error;
use crate::observability::metrics;

/// Holds the first fatal failure of a server run.
#[derive(Debug, Clone, Default)]
pub struct FatalSlot(Arc<OnceLock<String>>);

impl FatalSlot {
    /// Record `message`. Returns false when a failure was already recorded.
    pub fn record(&self, message: String) -> bool {
        self.0.set(message).is_ok()
    }

    pub fn get(&self) -> Option<Error> {
        self.0.get().map(|message| Error::Fatal(message.clone()))
    }
}

pub struct FailFast {
    inner: Arc<dyn Handler>,
    fatal: FatalSlot,
    trigger: CancellationToken,
}

impl FailFast {
    /// `trigger` is cancelled on the first fatal failure.
    pub fn new(inner: Arc<dyn Handler>, fatal: FatalSlot, trigger: CancellationToken) -> Self {
        Self {
            inner,
            fatal,
            trigger,
        }
    }
}

impl Handler for FailFast {
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        let fatal = self.fatal.clone();
        let trigger = self.trigger.clone();
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(fut) => fut,
            Err(payload) => {
                let err = fail(&fatal, &trigger, HandlerError::Panicked(panic_message(&*payload)));
                return Box::pin(futures_util::future::ready(Err(err)));
            }
        };
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(res)) => Ok(res),
                Ok(Err(HandlerError::Abort)) => Err(HandlerError::Abort),
                Ok(Err(err)) => Err(fail(&fatal, &trigger, err)),
                Err(payload) => Err(fail(
                    &fatal,
                    &trigger,
                    HandlerError::Panicked(panic_message(&*payload)),
                )),
            }
        })
    }
}

fn fail(fatal: &FatalSlot, trigger: &CancellationToken, err: HandlerError) -> HandlerError {
    let backtrace = Backtrace::force_capture();
    tracing::error!(error = %err, backtrace = %backtrace, "Unexpected handler failure, shutting down");
    metrics::handler_aborted("failed");
    fatal.record(err.to_string());
    trigger.cancel();
    HandlerError::Abort
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
