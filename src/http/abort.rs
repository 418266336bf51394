//! Stoppable gate in front of the handler.
//!
//! # Responsibilities
//! - Refuse new calls once stopped, without ever reaching the handler
//! - Let `stop` return only after every admitted call has finished
//!
//! # Design Decisions
//! - The stopped check and the in-flight increment happen under one lock,
//!   so a call is either admitted before `stop` or refused after it
//! - The in-flight slot is released by a guard owned by the returned
//!   future, which covers completion, errors, panics and cancellation

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future;
use http::Request;
use tokio::sync::Notify;

use super::body::Body;
use super::handler::{Handler, HandlerError, HandlerFuture};
use crate::observability::metrics;

#[derive(Debug, Default)]
struct GateState {
    stopped: bool,
    inflight: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<GateState>,
    drained: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wraps a handler so it can be stopped. After [`AbortGate::stop`] every
/// call fails with [`HandlerError::Abort`].
pub struct AbortGate {
    inner: Arc<dyn Handler>,
    shared: Arc<Shared>,
}

impl AbortGate {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Refuse further calls and wait for admitted ones to finish.
    pub async fn stop(&self) {
        self.shared.lock().stopped = true;
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let inflight = self.shared.lock().inflight;
            if inflight == 0 {
                return;
            }
            tracing::debug!(inflight, "Waiting for in-flight requests");
            drained.await;
        }
    }

    pub fn inflight(&self) -> usize {
        self.shared.lock().inflight
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }
}

struct InflightGuard(Arc<Shared>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.inflight -= 1;
        if state.inflight == 0 {
            drop(state);
            self.0.drained.notify_waiters();
        }
    }
}

impl Handler for AbortGate {
    fn call(&self, req: Request<Body>) -> HandlerFuture {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                drop(state);
                tracing::debug!(uri = %req.uri(), "Request after stop, aborting");
                metrics::handler_aborted("stopped");
                return Box::pin(future::ready(Err(HandlerError::Abort)));
            }
            state.inflight += 1;
        }
        let guard = InflightGuard(self.shared.clone());
        let fut = self.inner.call(req);
        Box::pin(async move {
            let _guard = guard;
            fut.await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::body;
    use crate::http::handler::handler_fn;
    use http::Response;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn stop_waits_for_inflight_then_refuses() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let slow = handler_fn(move |_req| {
            let release_rx = release_rx.clone();
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(Response::new(body::empty()))
            }
        });
        let gate = Arc::new(AbortGate::new(slow));

        let inflight = tokio::spawn(gate.call(Request::new(body::empty())));
        assert_eq!(gate.inflight(), 1);

        let stopping = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());
        assert!(matches!(
            gate.call(Request::new(body::empty())).await,
            Err(HandlerError::Abort)
        ));

        release_tx.send(()).unwrap();
        assert!(inflight.await.unwrap().is_ok());
        tokio::time::timeout(Duration::from_secs(1), stopping)
            .await
            .expect("stop returns once drained")
            .unwrap();
        assert_eq!(gate.inflight(), 0);
    }

    #[tokio::test]
    async fn dropped_call_releases_slot() {
        let pending = handler_fn(|_req| async {
            futures_util::future::pending::<()>().await;
            Ok(Response::new(body::empty()))
        });
        let gate = AbortGate::new(pending);
        let fut = gate.call(Request::new(body::empty()));
        assert_eq!(gate.inflight(), 1);
        drop(fut);
        assert_eq!(gate.inflight(), 0);
        tokio::time::timeout(Duration::from_millis(100), gate.stop())
            .await
            .unwrap();
        assert!(gate.is_stopped());
    }
}
