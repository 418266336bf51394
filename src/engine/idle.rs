//! Idle tracking for kept-alive connections.
//!
//! A connection is idle while no handler call is waiting for its
//! response. The idle clock restarts each time the last in-flight call
//! finishes.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::http::HandlerFuture;

#[derive(Debug, Clone, Copy)]
struct IdleState {
    in_flight: usize,
    since: Instant,
}

/// Per-connection request activity. Clones observe the same connection.
#[derive(Clone)]
pub(crate) struct Activity {
    state: Arc<watch::Sender<IdleState>>,
}

impl Activity {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(IdleState {
            in_flight: 0,
            since: Instant::now(),
        });
        Self { state: Arc::new(tx) }
    }

    /// Count `call` as in flight until it resolves or is dropped.
    pub fn track(&self, call: HandlerFuture) -> HandlerFuture {
        self.state.send_modify(|s| s.in_flight += 1);
        let guard = InFlight {
            state: self.state.clone(),
        };
        Box::pin(async move {
            let result = call.await;
            drop(guard);
            result
        })
    }

    /// Resolve once the connection has been idle for `timeout`. Never
    /// resolves when `timeout` is `None`.
    pub async fn expired(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return future::pending().await;
        };
        let mut rx = self.state.subscribe();
        loop {
            let idle = *rx.borrow_and_update();
            if idle.in_flight > 0 {
                // The sender lives in `self`, so the channel cannot close here.
                let _ = rx.changed().await;
                continue;
            }
            let deadline = idle.since + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = rx.changed() => {}
            }
        }
    }
}

struct InFlight {
    state: Arc<watch::Sender<IdleState>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.send_modify(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            if s.in_flight == 0 {
                s.since = Instant::now();
            }
        });
    }
}
