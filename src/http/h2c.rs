//! Cleartext HTTP/2 with prior knowledge (h2c).
//!
//! The HTTP/1 engine parses `PRI * HTTP/2.0` as a request. This handler
//! recognises it, takes the raw connection, checks the rest of the client
//! preface and hands the connection to the HTTP/2 engine.
//!
//! # Connection states
//! ```text
//! pending ──engine reports New──▶ tracked ──▶ serving ──▶ done
//!    │                                                     ▲
//!    └──────────── bad preface / force close ──────────────┘
//! ```
//! Each connection is counted twice from the moment it is registered,
//! before the hijack removes it from the HTTP/1 engine's bookkeeping:
//! `track_wg` until the HTTP/2 engine has registered it, `serve_wg` until
//! its serve loop returns.
//!
//! # Shutdown
//! Wait for `track_wg`, run the HTTP/1 engine's shutdown hooks (which
//! drain the HTTP/2 engine), wait for `serve_wg`. If the scope expires
//! first every connection is force-closed and the waits are abandoned.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{Request, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufWriter, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::body::Body;
use super::handler::{Handler, HandlerError, HandlerFuture};
use crate::engine::{H1Engine, H2Engine, Hijack, Hijacked, ServeConnOpts};
use crate::error::Error;
use crate::net::{BufferPool, ConnState, ConnStateHook, Protocol, Rewind, Transport, WaitGroup};
use crate::observability::metrics;

/// The full HTTP/2 client connection preface.
const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
/// What must follow the `PRI * HTTP/2.0` request head.
const PREFACE_TAIL: &[u8] = b"SM\r\n\r\n";

pub const DEFAULT_PREFACE_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether `req` is the request line of an HTTP/2 prior-knowledge preface.
pub fn is_prior_knowledge<B>(req: &Request<B>) -> bool {
    req.method().as_str() == "PRI"
        && req.headers().is_empty()
        && req.uri().path() == "*"
        && req.version() == Version::HTTP_2
}

struct PendingConn {
    tracked: bool,
    kill: CancellationToken,
}

#[derive(Default)]
struct Registry {
    conns: HashMap<u64, PendingConn>,
    next: u64,
    force_closed: bool,
}

struct Inner {
    fallback: Arc<dyn Handler>,
    h2: Arc<H2Engine>,
    pool: BufferPool,
    preface_timeout: Duration,
    registry: Mutex<Registry>,
    /// Connections the HTTP/2 engine has not registered yet.
    track_wg: WaitGroup,
    /// Connections whose serve loop has not returned.
    serve_wg: WaitGroup,
}

/// Handler that upgrades prior-knowledge requests and passes every other
/// request to `fallback`.
#[derive(Clone)]
pub struct H2cHandler {
    inner: Arc<Inner>,
}

impl H2cHandler {
    pub fn new(
        fallback: Arc<dyn Handler>,
        h2: Arc<H2Engine>,
        pool: BufferPool,
        preface_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fallback,
                h2,
                pool,
                preface_timeout,
                registry: Mutex::new(Registry::default()),
                track_wg: WaitGroup::new(),
                serve_wg: WaitGroup::new(),
            }),
        }
    }

    /// Upgraded connections not yet finished.
    pub fn active(&self) -> usize {
        self.inner.serve_wg.count()
    }

    /// Drain upgraded connections after running the HTTP/1 engine's own
    /// shutdown. Returns [`Error::Cancelled`] after force-closing every
    /// upgraded connection if `scope` is cancelled first.
    pub async fn shutdown(&self, scope: &CancellationToken, h1: &H1Engine) -> Result<(), Error> {
        let staged = async {
            self.inner.track_wg.wait().await;
            h1.shutdown(scope).await?;
            self.inner.serve_wg.wait().await;
            Ok(())
        };
        let result = tokio::select! {
            result = staged => result,
            _ = scope.cancelled() => Err(Error::Cancelled),
        };
        if result.is_err() && scope.is_cancelled() {
            self.inner.close_all();
        }
        result
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a placeholder before the connection is hijacked.
    fn add_pending(self: &Arc<Self>) -> PendingGuard {
        let kill = CancellationToken::new();
        let key = {
            let mut registry = self.registry();
            if registry.force_closed {
                kill.cancel();
            }
            let key = registry.next;
            registry.next += 1;
            registry.conns.insert(
                key,
                PendingConn {
                    tracked: false,
                    kill: kill.clone(),
                },
            );
            self.track_wg.add(1);
            self.serve_wg.add(1);
            key
        };
        PendingGuard {
            inner: self.clone(),
            key,
            kill,
        }
    }

    fn mark_tracked(&self, key: u64) {
        let newly_tracked = match self.registry().conns.get_mut(&key) {
            Some(conn) if !conn.tracked => {
                conn.tracked = true;
                true
            }
            _ => false,
        };
        if newly_tracked {
            self.track_wg.done();
        }
    }

    fn close_all(&self) {
        let mut registry = self.registry();
        registry.force_closed = true;
        for conn in registry.conns.values() {
            conn.kill.cancel();
        }
        if !registry.conns.is_empty() {
            tracing::debug!(connections = registry.conns.len(), "Force-closing h2c connections");
        }
    }

    async fn upgrade(self: Arc<Self>, hijack: Hijack) -> Result<(), HandlerError> {
        let pending = self.add_pending();
        let Some(Hijacked { io, read_buf, mut info }) = hijack.take() else {
            tracing::warn!("h2c connection already taken");
            return Err(HandlerError::Abort);
        };
        if pending.kill.is_cancelled() {
            return Err(HandlerError::Abort);
        }

        let (io, rest) = match self.read_preface_tail(io, read_buf, &pending.kill).await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(connection_id = %info.id, error = %e, "Invalid h2c preface");
                metrics::handler_aborted("protocol");
                return Err(HandlerError::Abort);
            }
        };
        metrics::h2c_upgraded();
        tracing::debug!(connection_id = %info.id, "Upgraded to h2c");

        let mut replay = BytesMut::with_capacity(CLIENT_PREFACE.len() + rest.len());
        replay.extend_from_slice(CLIENT_PREFACE);
        replay.extend_from_slice(&rest);
        let conn = Rewind::new(FlushEach::new(io), replay.freeze());

        info.protocol = Protocol::Http2;
        let id = info.id;
        let hook: ConnStateHook = {
            let inner = self.clone();
            let key = pending.key;
            Arc::new(move |_, state| {
                if state == ConnState::New {
                    inner.mark_tracked(key);
                }
            })
        };
        let opts = ServeConnOpts {
            handler: self.fallback.clone(),
            conn_state: Some(hook),
            info,
            graceful: None,
        };
        tokio::select! {
            _ = pending.kill.cancelled() => {
                tracing::debug!(connection_id = %id, "h2c connection force-closed");
            }
            result = self.h2.serve_connection(conn, opts) => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %id, error = %e, "h2c connection ended with error");
                }
            }
        }
        Ok(())
    }

    /// Check that `SM\r\n\r\n` follows the request head. Returns the
    /// connection and whatever was read past the preface.
    async fn read_preface_tail(
        &self,
        mut io: Box<dyn Transport>,
        read_buf: Bytes,
        kill: &CancellationToken,
    ) -> io::Result<(Box<dyn Transport>, Bytes)> {
        let mut buf = self.pool.get();
        buf.extend_from_slice(&read_buf);
        let filled = tokio::select! {
            _ = kill.cancelled() => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "closed")),
            read = tokio::time::timeout(self.preface_timeout, fill(&mut io, &mut buf, PREFACE_TAIL.len())) => {
                read.unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "preface timed out")))
            }
        };
        let result = filled.and_then(|()| {
            if &buf[..PREFACE_TAIL.len()] == PREFACE_TAIL {
                Ok(Bytes::copy_from_slice(&buf[PREFACE_TAIL.len()..]))
            } else {
                Err(io::Error::new(io::ErrorKind::InvalidData, "preface mismatch"))
            }
        });
        self.pool.put(buf);
        result.map(|rest| (io, rest))
    }
}

async fn fill(io: &mut Box<dyn Transport>, buf: &mut BytesMut, len: usize) -> io::Result<()> {
    while buf.len() < len {
        if io.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
    Ok(())
}

/// Placeholder registration; leaving the registry on drop decrements
/// whichever counters have not fired yet.
struct PendingGuard {
    inner: Arc<Inner>,
    key: u64,
    kill: CancellationToken,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let removed = self.inner.registry().conns.remove(&self.key);
        if let Some(conn) = removed {
            if !conn.tracked {
                self.inner.track_wg.done();
            }
            self.inner.serve_wg.done();
        }
    }
}

impl Handler for H2cHandler {
    fn call(&self, mut req: Request<Body>) -> HandlerFuture {
        if !is_prior_knowledge(&req) {
            return self.inner.fallback.call(req);
        }
        let Some(hijack) = req.extensions_mut().remove::<Hijack>() else {
            tracing::warn!("h2c request without a hijackable connection");
            return Box::pin(async { Err(HandlerError::Abort) });
        };
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.upgrade(hijack).await?;
            // The connection is gone; there is nothing to respond on.
            Err(HandlerError::Abort)
        })
    }
}

/// Buffered writer that flushes after every write. The HTTP/2 engine
/// expects writes to reach the peer without an explicit flush.
struct FlushEach {
    inner: BufWriter<Box<dyn Transport>>,
    dirty: bool,
}

impl FlushEach {
    fn new(io: Box<dyn Transport>) -> Self {
        Self {
            inner: BufWriter::new(io),
            dirty: false,
        }
    }
}

impl AsyncRead for FlushEach {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlushEach {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.dirty {
            ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
            self.dirty = false;
        }
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        match Pin::new(&mut self.inner).poll_flush(cx) {
            Poll::Ready(result) => result?,
            Poll::Pending => self.dirty = true,
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
        self.dirty = false;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
