//! HTTP/2 engine: serves individual connections with hyper.
//!
//! # Responsibilities
//! - Serve one already established connection per call
//! - Keep a registry of served connections so a graceful shutdown can
//!   send GOAWAY to each of them
//! - Send GOAWAY once no request has been in flight for `idle_timeout_ms`
//! - Report `New` once a connection is registered and `Closed` when it ends
//!
//! # Design Decisions
//! - Draining is sticky: a connection registered after
//!   [`H2Engine::graceful_shutdown`] starts draining immediately
//! - No listener of its own; TLS connections arrive from the HTTP/1 engine
//!   after ALPN and cleartext ones from the h2c coordinator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::dispatch;
use super::idle::Activity;
use crate::config::H2Config;
use crate::error::Error;
use crate::http::Handler;
use crate::net::{ConnState, ConnStateHook, ConnectionId, ConnectionInfo, Protocol};
use crate::observability::metrics;

/// Per-connection parameters for [`H2Engine::serve_connection`].
pub struct ServeConnOpts {
    pub handler: Arc<dyn Handler>,
    /// Notified with `New` after registration and `Closed` at the end.
    pub conn_state: Option<ConnStateHook>,
    pub info: ConnectionInfo,
    /// Parent token whose cancellation drains this connection.
    pub graceful: Option<CancellationToken>,
}

pub struct H2Engine {
    config: H2Config,
    conns: DashMap<ConnectionId, CancellationToken>,
    draining: AtomicBool,
}

impl H2Engine {
    pub fn new(config: H2Config) -> Self {
        Self {
            config,
            conns: DashMap::new(),
            draining: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &H2Config {
        &self.config
    }

    pub fn active_connections(&self) -> usize {
        self.conns.len()
    }

    /// Send GOAWAY on every registered connection and on every connection
    /// registered from now on.
    pub fn graceful_shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        for entry in self.conns.iter() {
            entry.value().cancel();
        }
        tracing::debug!(connections = self.conns.len(), "HTTP/2 graceful shutdown");
    }

    fn builder(&self) -> http2::Builder<TokioExecutor> {
        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder.timer(TokioTimer::new());
        if let Some(n) = self.config.max_concurrent_streams {
            builder.max_concurrent_streams(n);
        }
        if let Some(n) = self.config.max_frame_size {
            builder.max_frame_size(n);
        }
        if let Some(n) = self.config.initial_stream_window_size {
            builder.initial_stream_window_size(n);
        }
        if let Some(n) = self.config.initial_connection_window_size {
            builder.initial_connection_window_size(n);
        }
        if let Some(n) = self.config.max_header_list_size {
            builder.max_header_list_size(n);
        }
        if let Some(interval) = self.config.keep_alive_interval() {
            builder
                .keep_alive_interval(interval)
                .keep_alive_timeout(self.config.keep_alive_timeout());
        }
        builder
    }

    /// Serve one connection until it closes or finishes draining.
    pub async fn serve_connection<T>(&self, io: T, opts: ServeConnOpts) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ServeConnOpts {
            handler,
            conn_state,
            info,
            graceful,
        } = opts;
        let id = info.id;
        let protocol = info.protocol;
        let drain = graceful.map(|t| t.child_token()).unwrap_or_default();

        self.conns.insert(id, drain.clone());
        if self.draining.load(Ordering::SeqCst) {
            drain.cancel();
        }
        let _registration = Registration::new(self, id, protocol, conn_state);
        tracing::debug!(connection_id = %id, remote_addr = ?info.remote_addr, tls = info.tls, "Serving HTTP/2 connection");

        let activity = Activity::new();
        let service = {
            let activity = activity.clone();
            service_fn(move |req: hyper::Request<Incoming>| activity.track(dispatch(&handler, &info, req)))
        };
        let conn = self.builder().serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = drain.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
            _ = activity.expired(self.config.idle_timeout()) => {
                tracing::debug!(connection_id = %id, "Idle HTTP/2 connection, sending GOAWAY");
                drain.cancel();
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        result.map_err(|e| Error::Engine(format!("http2 connection: {e}")))
    }
}

/// Reports `New` on creation and removes the connection, reporting
/// `Closed`, on drop. Dropping the serve future mid-connection counts.
struct Registration<'a> {
    engine: &'a H2Engine,
    id: ConnectionId,
    protocol: Protocol,
    conn_state: Option<ConnStateHook>,
}

impl<'a> Registration<'a> {
    fn new(
        engine: &'a H2Engine,
        id: ConnectionId,
        protocol: Protocol,
        conn_state: Option<ConnStateHook>,
    ) -> Self {
        let registration = Self {
            engine,
            id,
            protocol,
            conn_state,
        };
        registration.notify(ConnState::New);
        metrics::connection_opened(protocol);
        registration
    }

    fn notify(&self, state: ConnState) {
        if let Some(hook) = &self.conn_state {
            hook(self.id, state);
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.engine.conns.remove(&self.id);
        metrics::connection_closed(self.protocol);
        self.notify(ConnState::Closed);
        tracing::debug!(connection_id = %self.id, "HTTP/2 connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{body, handler_fn};
    use crate::net::Carrier;
    use http::Response;
    use std::sync::Mutex;
    use std::time::Duration;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId::next(Carrier::Tcp),
            remote_addr: None,
            protocol: Protocol::Http2,
            tls: false,
        }
    }

    #[tokio::test]
    async fn reports_new_then_closed_while_draining() {
        let engine = Arc::new(H2Engine::new(H2Config::default()));
        engine.graceful_shutdown();

        let states = Arc::new(Mutex::new(Vec::new()));
        let hook: ConnStateHook = {
            let states = states.clone();
            Arc::new(move |_, state| states.lock().unwrap().push(state))
        };
        let (server_io, client_io) = tokio::io::duplex(1024);
        drop(client_io);
        let opts = ServeConnOpts {
            handler: handler_fn(|_req| async { Ok(Response::new(body::empty())) }),
            conn_state: Some(hook),
            info: info(),
            graceful: None,
        };

        // The peer is gone, so the preface read fails and the connection ends.
        let served = tokio::time::timeout(
            Duration::from_secs(2),
            engine.serve_connection(server_io, opts),
        )
        .await;
        assert!(served.is_ok());
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnState::New, ConnState::Closed]
        );
        assert_eq!(engine.active_connections(), 0);
    }
}
