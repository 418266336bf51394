//! Per-socket runners: one drives the HTTP/1+2 engine over a stream
//! socket, the other the HTTP/3 engine over a packet socket.
//!
//! # Shutdown sequence (TCP)
//! ```text
//! ready callback returns
//!     → family shutdown, once per family: engine.shutdown(scope),
//!       engine.close() if the scope expired first
//!     → engine.close() again, always: reclaims connections accepted
//!       between "shutdown requested" and "serve loop saw it"
//!     → listener.close()
//!     → join serve loop, Error::Closed counts as success
//!     → combine everything
//! ```

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::parallel::{ReadyCallback, Runnable};
use super::shutdown::ShutdownOnce;
use crate::engine::{EarlyListener, H1Engine, H3Engine};
use crate::error::{ignore_closed, Error};
use crate::net::{OnceCloseListener, PacketSocket, StreamListener, StreamSocket};

pub struct TcpRunner {
    socket: Arc<dyn StreamSocket>,
    engine: H1Engine,
    once: ShutdownOnce,
}

impl TcpRunner {
    /// `once` must be shared by every TCP runner of the server.
    pub fn new(socket: Arc<dyn StreamSocket>, engine: H1Engine, once: ShutdownOnce) -> Self {
        Self {
            socket,
            engine,
            once,
        }
    }

    async fn run_inner(&self, scope: &CancellationToken, ready: ReadyCallback) -> Result<(), Error> {
        let listener: Arc<dyn StreamListener> =
            Arc::new(OnceCloseListener::new(self.socket.listen(scope).await?));

        let fg = scope.child_token();
        let serving = tokio::spawn({
            let engine = self.engine.clone();
            let listener = listener.clone();
            let fg = fg.clone();
            async move {
                let result = engine.serve(listener).await;
                fg.cancel();
                result
            }
        });

        let ready_result = ready(fg).await;

        let engine = &self.engine;
        let shutdown_result = self
            .once
            .run(|| async move {
                let result = engine.shutdown(scope).await;
                if result.is_err() && scope.is_cancelled() {
                    tracing::warn!("Graceful HTTP/1 shutdown expired, closing connections");
                    engine.close()?;
                }
                result
            })
            .await;
        let close_result = self.engine.close();
        let listener_result = listener.close().map_err(Error::from);
        let serve_result = match serving.await {
            Ok(result) => ignore_closed(result),
            Err(e) => Err(Error::Engine(format!("HTTP/1 serve task: {e}"))),
        };

        Error::combine([
            ready_result,
            shutdown_result,
            close_result,
            listener_result,
            serve_result,
        ])
    }
}

impl Runnable for TcpRunner {
    fn run<'a>(
        &'a self,
        scope: &'a CancellationToken,
        ready: ReadyCallback,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.run_inner(scope, ready))
    }
}

pub struct QuicRunner {
    socket: Arc<dyn PacketSocket>,
    engine: H3Engine,
    tls: Option<Arc<rustls::ServerConfig>>,
    once: ShutdownOnce,
}

impl QuicRunner {
    /// `once` must be shared by every QUIC runner of the server.
    pub fn new(
        socket: Arc<dyn PacketSocket>,
        engine: H3Engine,
        tls: Option<Arc<rustls::ServerConfig>>,
        once: ShutdownOnce,
    ) -> Self {
        Self {
            socket,
            engine,
            tls,
            once,
        }
    }

    async fn run_inner(&self, scope: &CancellationToken, ready: ReadyCallback) -> Result<(), Error> {
        let tls = self
            .tls
            .as_ref()
            .ok_or_else(|| Error::Config("HTTP/3 requires a TLS configuration".into()))?;
        let mut quic = self.engine.config().quic.clone();
        if self.engine.config().enable_datagrams {
            quic.enable_datagrams = true;
        }

        let socket = self.socket.listen(scope).await?;
        let listener = EarlyListener::bind(socket, tls, &quic)?;

        let fg = scope.child_token();
        let serving = tokio::spawn({
            let engine = self.engine.clone();
            let listener = listener.clone();
            let fg = fg.clone();
            async move {
                let result = engine.serve_listener(listener).await;
                fg.cancel();
                result
            }
        });

        let ready_result = ready(fg).await;

        // The engine's shutdown waits for every request, so one phase is enough.
        let engine = &self.engine;
        let shutdown_result = self.once.run(|| engine.shutdown(scope)).await;
        listener.close();
        let serve_result = match serving.await {
            Ok(result) => ignore_closed(result),
            Err(e) => Err(Error::Engine(format!("HTTP/3 serve task: {e}"))),
        };

        Error::combine([ready_result, shutdown_result, serve_result])
    }
}

impl Runnable for QuicRunner {
    fn run<'a>(
        &'a self,
        scope: &'a CancellationToken,
        ready: ReadyCallback,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(self.run_inner(scope, ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{H1Config, H3Config};
    use crate::engine::{H1Services, H2Engine};
    use crate::http::not_found;
    use crate::net::{self, BufferPool};

    fn h1() -> H1Engine {
        H1Engine::new(
            H1Config::default(),
            H1Services {
                handler: not_found(),
                h2: Arc::new(H2Engine::new(Default::default())),
                h2_handler: not_found(),
                conn_state: None,
                pool: BufferPool::default(),
            },
        )
    }

    fn ready_now() -> ReadyCallback {
        Box::new(|_| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn tcp_runner_treats_closed_engine_as_success() {
        let runner = TcpRunner::new(net::tcp("127.0.0.1:0"), h1(), ShutdownOnce::new());
        runner.run(&CancellationToken::new(), ready_now()).await.unwrap();
    }

    #[tokio::test]
    async fn tcp_runner_propagates_listen_errors() {
        let runner = TcpRunner::new(net::tcp("not an address"), h1(), ShutdownOnce::new());
        let err = runner
            .run(&CancellationToken::new(), ready_now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Listen { .. }));
    }

    #[tokio::test]
    async fn quic_runner_requires_tls() {
        let runner = QuicRunner::new(
            net::udp("127.0.0.1:0"),
            H3Engine::new(not_found(), H3Config::default()),
            None,
            ShutdownOnce::new(),
        );
        let err = runner
            .run(&CancellationToken::new(), ready_now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
