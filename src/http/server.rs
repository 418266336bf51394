//! The server orchestrator.
//!
//! # Responsibilities
//! - Build the engines and handler wrappers for one run
//! - Run one runner per socket behind a single ready callback
//! - Return only once the handler can no longer be called
//!
//! # Shutdown order
//! ```text
//! run_all returns (every runner shut down and force-closed)
//!     → lifecycle tracker reaches zero (HTTP/1 and HTTP/2-over-TLS)
//!     → h2c coordinator drained (cleartext HTTP/2)
//!     → abort gate stopped (late calls from engine tasks refused)
//!     → errors combined with the first fatal handler failure
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::abort::AbortGate;
use super::fail_fast::{FailFast, FatalSlot};
use super::h2c::{H2cHandler, DEFAULT_PREFACE_TIMEOUT};
use super::handler::Handler;
use crate::config::Options;
use crate::engine::{H1Engine, H1Services, H2Engine, H3Engine};
use crate::error::Error;
use crate::lifecycle::{run_all, QuicRunner, ReadyCallback, Runnable, ShutdownOnce, TcpRunner};
use crate::net::{combine_hooks, LifecycleTracker};

/// Serves HTTP/1, HTTP/2 and HTTP/3 on every configured socket.
#[derive(Debug, Clone)]
pub struct Server {
    options: Options,
}

impl Server {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Serve until `ready` returns, then shut down.
    ///
    /// `ready` runs once every socket is listening. Its token is cancelled
    /// when a serve loop stops on its own or a handler fails fatally; it
    /// should return then, or whenever the server should stop. Graceful
    /// shutdown lasts until `scope` is cancelled, after which connections
    /// are closed.
    ///
    /// When this returns the handler has no call in flight and will never
    /// be called again by this run.
    pub async fn run<F, Fut>(&self, scope: &CancellationToken, ready: F) -> Result<(), Error>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let opts = &self.options;

        let fatal = FatalSlot::default();
        let failed = CancellationToken::new();
        let gate = Arc::new(AbortGate::new(opts.handler.clone()));
        let handler: Arc<dyn Handler> =
            Arc::new(FailFast::new(gate.clone(), fatal.clone(), failed.clone()));

        let pool = opts.buffer_pool.clone().unwrap_or_default();
        let h2 = Arc::new(H2Engine::new(opts.h2.clone()));
        let h2c = opts.h2.cleartext.then(|| {
            H2cHandler::new(handler.clone(), h2.clone(), pool.clone(), DEFAULT_PREFACE_TIMEOUT)
        });

        let tracker = LifecycleTracker::new();
        let h1_handler: Arc<dyn Handler> = match &h2c {
            Some(h2c) => Arc::new(h2c.clone()),
            None => handler.clone(),
        };
        let h1 = H1Engine::new(
            opts.h1.clone(),
            H1Services {
                handler: h1_handler,
                h2: h2.clone(),
                h2_handler: handler.clone(),
                conn_state: combine_hooks(Some(tracker.hook()), opts.conn_state.clone()),
                pool,
            },
        );
        {
            let h2 = h2.clone();
            h1.register_on_shutdown(move || h2.graceful_shutdown());
        }
        let h3 = H3Engine::new(handler.clone(), opts.h3.clone());

        let tcp_once = ShutdownOnce::new();
        let quic_once = ShutdownOnce::new();
        let mut units: Vec<Box<dyn Runnable>> = Vec::new();
        for socket in &opts.stream_sockets {
            units.push(Box::new(TcpRunner::new(
                socket.clone(),
                h1.clone(),
                tcp_once.clone(),
            )));
        }
        for socket in &opts.packet_sockets {
            units.push(Box::new(QuicRunner::new(
                socket.clone(),
                h3.clone(),
                opts.h3_tls.clone(),
                quic_once.clone(),
            )));
        }

        let ready: ReadyCallback = Box::new(move |fg| {
            Box::pin(async move {
                let token = fg.child_token();
                let callback = ready(token.clone());
                tokio::pin!(callback);
                tokio::select! {
                    result = &mut callback => result,
                    _ = failed.cancelled() => {
                        token.cancel();
                        callback.await
                    }
                }
            })
        });

        tracing::info!(
            stream_sockets = opts.stream_sockets.len(),
            packet_sockets = opts.packet_sockets.len(),
            "Server starting"
        );
        let run_result = run_all(&units, scope, ready).await;

        tracker.wait().await;
        let h2c_result = match &h2c {
            Some(h2c) => h2c.shutdown(scope, &h1).await,
            None => Ok(()),
        };
        gate.stop().await;
        tracing::info!("Server stopped");

        Error::combine([run_result, h2c_result, fatal.get().map_or(Ok(()), Err)])
    }
}
