//! HTTP/1 engine: accept loop, per-connection tasks and staged shutdown.
//!
//! # Responsibilities
//! - Accept from any number of listeners, retrying transient failures
//! - Track every connection and report its [`ConnState`] transitions
//! - Route TLS connections that negotiated `h2` to the HTTP/2 engine
//! - Intercept the prior-knowledge `PRI * HTTP/2.0` request line, which
//!   hyper cannot represent, and offer it to the handler with a [`Hijack`]
//! - Close kept-alive connections that stay idle past `idle_timeout_ms`
//! - `shutdown`: stop accepting, drain connections, wait for them
//! - `close`: stop accepting and drop every tracked connection
//!
//! # Design Decisions
//! - The tracking map and its lock are never held across I/O
//! - A connection leaves the map exactly once, on hijack or on close,
//!   and only the call that removes it reports the terminal state
//! - Hijacked connections are outside the map, so `close` leaves them
//!   to their new owner

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::{Request, Version};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dispatch;
use super::h2::{H2Engine, ServeConnOpts};
use super::hijack::{Hijack, Hijacked};
use super::idle::Activity;
use crate::config::H1Config;
use crate::error::Error;
use crate::http::{body, Body, Handler};
use crate::net::{
    Accepted, BufferPool, Carrier, ConnState, ConnStateHook, ConnectionId, ConnectionInfo, Protocol,
    Rewind, StreamListener, Transport, WaitGroup,
};
use crate::observability::metrics;
use crate::resilience::backoff::{accept_backoff, is_transient_accept_error};

const PRI_PREFIX: &[u8] = b"PRI ";
const MAX_PREAMBLE: usize = 16 * 1024;
const MAX_PREAMBLE_HEADERS: usize = 64;
const VERSION_NOT_SUPPORTED: &[u8] =
    b"HTTP/1.1 505 HTTP Version Not Supported\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Collaborators of the HTTP/1 engine.
pub struct H1Services {
    /// Handler for HTTP/1 requests, including the prior-knowledge line.
    pub handler: Arc<dyn Handler>,
    /// Engine and handler for TLS connections that negotiated `h2`.
    pub h2: Arc<H2Engine>,
    pub h2_handler: Arc<dyn Handler>,
    pub conn_state: Option<ConnStateHook>,
    pub pool: BufferPool,
}

type ShutdownHook = Arc<dyn Fn() + Send + Sync>;

struct ConnHandle {
    graceful: CancellationToken,
    kill: CancellationToken,
}

#[derive(Default)]
struct EngineState {
    shutting_down: bool,
    closed: bool,
    next_listener: u64,
    listeners: HashMap<u64, CancellationToken>,
    conns: HashMap<ConnectionId, ConnHandle>,
    on_shutdown: Vec<ShutdownHook>,
}

struct Inner {
    config: H1Config,
    services: H1Services,
    state: Mutex<EngineState>,
    live: WaitGroup,
}

/// Shared handle to one HTTP/1 engine. Clones drive the same engine.
#[derive(Clone)]
pub struct H1Engine {
    inner: Arc<Inner>,
}

enum Preamble {
    /// Nothing arrived before the peer closed or shutdown began.
    Empty,
    Http1(Bytes),
    PriorKnowledge { head: Bytes, rest: Bytes },
}

impl H1Engine {
    pub fn new(config: H1Config, services: H1Services) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                services,
                state: Mutex::new(EngineState::default()),
                live: WaitGroup::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connections currently tracked (not yet closed or hijacked).
    pub fn active_connections(&self) -> usize {
        self.inner.live.count()
    }

    /// Register a function called on every [`H1Engine::shutdown`].
    pub fn register_on_shutdown(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.lock().on_shutdown.push(Arc::new(hook));
    }

    /// Accept and serve connections until shutdown, close or a
    /// non-transient accept error. Returns [`Error::Closed`] after
    /// shutdown or close.
    pub async fn serve(&self, listener: Arc<dyn StreamListener>) -> Result<(), Error> {
        let (key, stop) = {
            let mut state = self.lock();
            if state.shutting_down {
                return Err(Error::Closed);
            }
            let key = state.next_listener;
            state.next_listener += 1;
            let stop = CancellationToken::new();
            state.listeners.insert(key, stop.clone());
            (key, stop)
        };
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, "HTTP/1 engine accepting");
        }

        let result = self.accept_loop(listener.as_ref(), &stop).await;
        self.lock().listeners.remove(&key);
        result
    }

    async fn accept_loop(
        &self,
        listener: &dyn StreamListener,
        stop: &CancellationToken,
    ) -> Result<(), Error> {
        let mut failures = 0u32;
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => return Err(Error::Closed),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(accepted) => {
                    failures = 0;
                    self.track_and_spawn(accepted);
                }
                Err(e) => {
                    if self.lock().shutting_down {
                        return Err(Error::Closed);
                    }
                    if !is_transient_accept_error(&e) {
                        tracing::error!(error = %e, "Accept failed");
                        return Err(Error::Accept(e));
                    }
                    failures += 1;
                    let delay = accept_backoff(failures);
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Accept error, retrying");
                    tokio::select! {
                        _ = stop.cancelled() => return Err(Error::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn track_and_spawn(&self, accepted: Accepted) {
        let id = ConnectionId::next(Carrier::Tcp);
        let handle = ConnHandle {
            graceful: CancellationToken::new(),
            kill: CancellationToken::new(),
        };
        let (graceful, kill) = (handle.graceful.clone(), handle.kill.clone());
        {
            let mut state = self.lock();
            if state.closed {
                tracing::debug!(connection_id = %id, "Engine closed, dropping connection");
                return;
            }
            if state.shutting_down {
                graceful.cancel();
            }
            state.conns.insert(id, handle);
            self.inner.live.add(1);
        }
        metrics::connection_opened(Protocol::Http1);
        self.notify(id, ConnState::New);
        tokio::spawn(self.clone().serve_conn(id, accepted, graceful, kill));
    }

    fn notify(&self, id: ConnectionId, state: ConnState) {
        if let Some(hook) = &self.inner.services.conn_state {
            hook(id, state);
        }
    }

    /// Remove `id` from tracking and report `state`. Later calls for the
    /// same connection do nothing.
    fn untrack(&self, id: ConnectionId, state: ConnState) -> bool {
        let removed = self.lock().conns.remove(&id).is_some();
        if removed {
            metrics::connection_closed(Protocol::Http1);
            self.notify(id, state);
            self.inner.live.done();
        }
        removed
    }

    async fn serve_conn(
        self,
        id: ConnectionId,
        accepted: Accepted,
        graceful: CancellationToken,
        kill: CancellationToken,
    ) {
        tokio::select! {
            _ = kill.cancelled() => {
                tracing::debug!(connection_id = %id, "Connection force-closed");
            }
            result = self.drive(id, accepted, &graceful) => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %id, error = %e, "Connection ended with error");
                }
            }
        }
        self.untrack(id, ConnState::Closed);
    }

    async fn drive(
        &self,
        id: ConnectionId,
        accepted: Accepted,
        graceful: &CancellationToken,
    ) -> Result<(), Error> {
        let deadline = Instant::now() + self.inner.config.read_header_timeout();
        let io = match tokio::time::timeout_at(deadline, accepted.io).await {
            Ok(io) => io?,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out").into())
            }
        };
        let mut info = ConnectionInfo {
            id,
            remote_addr: accepted.remote_addr,
            protocol: Protocol::Http1,
            tls: io.is_tls(),
        };

        if io.alpn_protocol().as_deref() == Some(b"h2".as_slice()) {
            info.protocol = Protocol::Http2;
            let opts = ServeConnOpts {
                handler: self.inner.services.h2_handler.clone(),
                conn_state: None,
                info,
                graceful: Some(graceful.clone()),
            };
            return self.inner.services.h2.serve_connection(io, opts).await;
        }

        let mut io = io;
        match self.read_preamble(&mut io, graceful, deadline).await? {
            Preamble::Empty => Ok(()),
            Preamble::Http1(prefix) => self.serve_http1(Rewind::new(io, prefix), info, graceful).await,
            Preamble::PriorKnowledge { head, rest } => match parse_prior_knowledge(&head) {
                Some(req) => self.serve_prior_knowledge(io, req, rest, info).await,
                None => {
                    let mut prefix = BytesMut::with_capacity(head.len() + rest.len());
                    prefix.extend_from_slice(&head);
                    prefix.extend_from_slice(&rest);
                    self.serve_http1(Rewind::new(io, prefix.freeze()), info, graceful)
                        .await
                }
            },
        }
    }

    /// Read enough of the first request to tell a prior-knowledge line
    /// from a regular HTTP/1 request.
    async fn read_preamble(
        &self,
        io: &mut Box<dyn Transport>,
        graceful: &CancellationToken,
        deadline: Instant,
    ) -> Result<Preamble, Error> {
        let pool = &self.inner.services.pool;
        let mut buf = pool.get();
        let result = fill_preamble(io, &mut buf, graceful, deadline).await;
        let preamble = result.map(|kind| match kind {
            PreambleKind::Empty => Preamble::Empty,
            PreambleKind::Http1 => Preamble::Http1(Bytes::copy_from_slice(&buf)),
            PreambleKind::PriorKnowledge { head_len } => Preamble::PriorKnowledge {
                head: Bytes::copy_from_slice(&buf[..head_len]),
                rest: Bytes::copy_from_slice(&buf[head_len..]),
            },
        });
        pool.put(buf);
        preamble.map_err(Error::from)
    }

    async fn serve_http1(
        &self,
        io: Rewind<Box<dyn Transport>>,
        info: ConnectionInfo,
        graceful: &CancellationToken,
    ) -> Result<(), Error> {
        let config = &self.inner.config;
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(config.read_header_timeout())
            .keep_alive(config.keep_alive)
            .half_close(config.half_close);
        if let Some(n) = config.max_buf_size {
            builder.max_buf_size(n);
        }
        if let Some(n) = config.max_headers {
            builder.max_headers(n);
        }

        let id = info.id;
        let activity = Activity::new();
        let handler = self.inner.services.handler.clone();
        let service = {
            let activity = activity.clone();
            service_fn(move |req: Request<Incoming>| activity.track(dispatch(&handler, &info, req)))
        };
        let conn = builder
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = graceful.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
            _ = activity.expired(config.idle_timeout()) => {
                tracing::debug!(connection_id = %id, "Idle connection timed out");
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        result.map_err(|e| Error::Engine(format!("http1 connection: {e}")))
    }

    async fn serve_prior_knowledge(
        &self,
        io: Box<dyn Transport>,
        mut req: Request<Body>,
        rest: Bytes,
        info: ConnectionInfo,
    ) -> Result<(), Error> {
        let id = info.id;
        let engine = self.clone();
        let hijack = Hijack::new(
            Hijacked {
                io,
                read_buf: rest,
                info: info.clone(),
            },
            move || {
                engine.untrack(id, ConnState::Hijacked);
            },
        );
        req.extensions_mut().insert(hijack.clone());
        req.extensions_mut().insert(info);

        let result = self.inner.services.handler.call(req).await;
        if let Some(Hijacked { mut io, .. }) = hijack.reclaim() {
            if let Err(e) = result {
                tracing::debug!(connection_id = %id, error = %e, "Prior-knowledge request not upgraded");
            }
            io.write_all(VERSION_NOT_SUPPORTED).await?;
            io.shutdown().await?;
        }
        Ok(())
    }

    /// Stop accepting, run the shutdown hooks, drain every connection and
    /// wait for them to finish. Returns [`Error::Cancelled`] if `scope` is
    /// cancelled first; connections are left running.
    pub async fn shutdown(&self, scope: &CancellationToken) -> Result<(), Error> {
        let hooks = {
            let mut state = self.lock();
            state.shutting_down = true;
            for stop in state.listeners.values() {
                stop.cancel();
            }
            for conn in state.conns.values() {
                conn.graceful.cancel();
            }
            state.on_shutdown.clone()
        };
        for hook in hooks {
            hook();
        }
        tracing::debug!(connections = self.active_connections(), "HTTP/1 graceful shutdown");

        tokio::select! {
            _ = self.inner.live.wait() => Ok(()),
            _ = scope.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Stop accepting and drop every tracked connection immediately.
    pub fn close(&self) -> Result<(), Error> {
        let mut state = self.lock();
        state.shutting_down = true;
        state.closed = true;
        for stop in state.listeners.values() {
            stop.cancel();
        }
        for conn in state.conns.values() {
            conn.kill.cancel();
        }
        if !state.conns.is_empty() {
            tracing::debug!(connections = state.conns.len(), "HTTP/1 engine force-closing connections");
        }
        Ok(())
    }
}

enum PreambleKind {
    Empty,
    Http1,
    PriorKnowledge { head_len: usize },
}

async fn fill_preamble(
    io: &mut Box<dyn Transport>,
    buf: &mut BytesMut,
    graceful: &CancellationToken,
    deadline: Instant,
) -> io::Result<PreambleKind> {
    loop {
        let seen = buf.len().min(PRI_PREFIX.len());
        if buf[..seen] != PRI_PREFIX[..seen] {
            return Ok(PreambleKind::Http1);
        }
        if seen == PRI_PREFIX.len() {
            if let Some(line_end) = find(buf, b"\r\n") {
                if !buf[..line_end].ends_with(b" HTTP/2.0") {
                    return Ok(PreambleKind::Http1);
                }
            }
            if let Some(end) = find(buf, b"\r\n\r\n") {
                return Ok(PreambleKind::PriorKnowledge { head_len: end + 4 });
            }
            if buf.len() > MAX_PREAMBLE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
            }
        }

        let idle = buf.is_empty();
        let n = tokio::select! {
            _ = graceful.cancelled(), if idle => return Ok(PreambleKind::Empty),
            read = tokio::time::timeout_at(deadline, io.read_buf(buf)) => match read {
                Ok(n) => n?,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "request head timed out")),
            },
        };
        if n == 0 {
            return Ok(if buf.is_empty() {
                PreambleKind::Empty
            } else {
                PreambleKind::Http1
            });
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse a `PRI <target> HTTP/2.0` request head into a request.
fn parse_prior_knowledge(head: &[u8]) -> Option<Request<Body>> {
    let line_end = find(head, b"\r\n")?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.splitn(3, ' ');
    let (method, target, version) = (parts.next()?, parts.next()?, parts.next()?);
    if version != "HTTP/2.0" {
        return None;
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_PREAMBLE_HEADERS];
    let httparse::Status::Complete((_, headers)) =
        httparse::parse_headers(&head[line_end + 2..], &mut headers).ok()?
    else {
        return None;
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(target)
        .version(Version::HTTP_2);
    for header in headers {
        builder = builder.header(header.name, header.value);
    }
    builder.body(body::empty()).ok()
}
