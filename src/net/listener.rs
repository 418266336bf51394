//! Stream listeners and the transport abstraction.
//!
//! # Responsibilities
//! - Define the byte-stream [`Transport`] handed to the protocol engines
//! - Accept connections from a bound TCP socket until closed
//! - Guarantee a listener's close runs at most once under concurrent callers
//!
//! # Design Decisions
//! - An accepted connection carries a lazy `io` future so a TLS handshake
//!   runs on the connection task, never on the accept loop
//! - Closing drops the TCP socket and cancels pending accepts through a
//!   `CancellationToken`

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// A bidirectional byte stream an engine can serve.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Protocol negotiated through TLS ALPN, if any.
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        None
    }

    fn is_tls(&self) -> bool {
        false
    }
}

impl Transport for TcpStream {}

impl Transport for DuplexStream {}

impl Transport for Box<dyn Transport> {
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        (**self).alpn_protocol()
    }

    fn is_tls(&self) -> bool {
        (**self).is_tls()
    }
}

/// A connection returned by [`StreamListener::accept`].
pub struct Accepted {
    pub remote_addr: Option<SocketAddr>,
    /// Resolves to the usable stream, running any handshake first.
    pub io: BoxFuture<'static, io::Result<Box<dyn Transport>>>,
}

impl Accepted {
    /// A connection that needs no handshake.
    pub fn ready<T: Transport>(io: T, remote_addr: Option<SocketAddr>) -> Self {
        let io: Box<dyn Transport> = Box::new(io);
        Self {
            remote_addr,
            io: Box::pin(async move { Ok(io) }),
        }
    }
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A listening stream endpoint.
pub trait StreamListener: Send + Sync {
    fn accept(&self) -> BoxFuture<'_, io::Result<Accepted>>;

    /// Stop accepting and release the socket. Pending and later accepts fail.
    fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub(crate) fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

/// TCP listener whose accepts are cancelled by `close`.
///
/// `close` drops the listening socket. An accept already in progress
/// holds its own handle until it wakes up and sees the close, so the port
/// is free once pending accepts have returned.
pub struct TcpStreamListener {
    inner: RwLock<Option<Arc<TcpListener>>>,
    local_addr: Option<SocketAddr>,
    closed: CancellationToken,
}

impl TcpStreamListener {
    pub fn new(inner: TcpListener) -> Self {
        Self {
            local_addr: inner.local_addr().ok(),
            inner: RwLock::new(Some(Arc::new(inner))),
            closed: CancellationToken::new(),
        }
    }
}

impl StreamListener for TcpStreamListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Accepted>> {
        Box::pin(async move {
            let inner = self
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or_else(listener_closed)?;
            let (stream, peer_addr) = tokio::select! {
                _ = self.closed.cancelled() => return Err(listener_closed()),
                accepted = inner.accept() => accepted?,
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
            tracing::trace!(peer_addr = %peer_addr, "Connection accepted");
            Ok(Accepted::ready(stream, Some(peer_addr)))
        })
    }

    fn close(&self) -> io::Result<()> {
        let socket = self.inner.write().unwrap_or_else(PoisonError::into_inner).take();
        if socket.is_none() {
            return Err(listener_closed());
        }
        self.closed.cancel();
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        let open = self.inner.read().unwrap_or_else(PoisonError::into_inner).clone();
        match (open, self.local_addr) {
            (Some(socket), _) => socket.local_addr(),
            (None, Some(addr)) => Ok(addr),
            (None, None) => Err(listener_closed()),
        }
    }
}

/// Runs the inner listener's close exactly once and hands every caller the
/// same result.
pub struct OnceCloseListener {
    inner: Box<dyn StreamListener>,
    result: OnceLock<Result<(), (io::ErrorKind, String)>>,
}

impl OnceCloseListener {
    pub fn new(inner: Box<dyn StreamListener>) -> Self {
        Self {
            inner,
            result: OnceLock::new(),
        }
    }
}

impl StreamListener for OnceCloseListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Accepted>> {
        self.inner.accept()
    }

    fn close(&self) -> io::Result<()> {
        self.result
            .get_or_init(|| {
                self.inner
                    .close()
                    .map_err(|e| (e.kind(), e.to_string()))
            })
            .clone()
            .map_err(|(kind, message)| io::Error::new(kind, message))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
