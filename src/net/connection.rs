//! Connection identity, state notifications and lifecycle tracking.
//!
//! # Responsibilities
//! - Allocate connection IDs that survive protocol switches
//! - Describe the per-connection context handed to every request
//! - Model the engine's per-connection state transitions as one enum
//! - Count connections that may still reach the handler
//!
//! # Design Decisions
//! - One dispatch point per connection: engines report [`ConnState`]
//!   through a single hook instead of separate callbacks per transition
//! - Counters are `watch` channels so waiters never poll

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Socket family a connection was accepted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Carrier {
    /// A stream socket: plain TCP, TLS or optional TLS.
    Tcp,
    /// A QUIC endpoint on a packet socket.
    Quic,
}

/// Identity of one accepted connection.
///
/// Allocated once at accept time and kept when the connection changes
/// protocol (ALPN `h2`, a prior-knowledge upgrade), so the HTTP/1 tracker,
/// the HTTP/2 drain registry and the h2c coordinator all agree on it.
/// Displays as `tcp-7` or `quic-3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    carrier: Carrier,
    seq: u64,
}

impl ConnectionId {
    /// Allocate the next ID. Sequence numbers are unique across carriers.
    pub fn next(carrier: Carrier) -> Self {
        Self {
            carrier,
            seq: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn carrier(&self) -> Carrier {
        self.carrier
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let carrier = match self.carrier {
            Carrier::Tcp => "tcp",
            Carrier::Quic => "quic",
        };
        write!(f, "{carrier}-{}", self.seq)
    }
}

/// Protocol family a connection is served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
            Protocol::Http3 => "http3",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection context, inserted as an extension into every request.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub protocol: Protocol,
    pub tls: bool,
}

/// Connection state transitions reported by the HTTP/1 and HTTP/2 engines.
///
/// For a given connection `New` is reported first and exactly one of
/// `Hijacked` or `Closed` follows it. The engine never invokes the handler
/// for that connection after the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Hijacked,
    Closed,
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConnState::New)
    }
}

/// Sink for connection state notifications.
pub type ConnStateHook = Arc<dyn Fn(ConnectionId, ConnState) + Send + Sync>;

/// Compose two optional hooks into one calling `a` then `b`.
pub fn combine_hooks(a: Option<ConnStateHook>, b: Option<ConnStateHook>) -> Option<ConnStateHook> {
    match (a, b) {
        (None, None) => None,
        (Some(hook), None) | (None, Some(hook)) => Some(hook),
        (Some(a), Some(b)) => Some(Arc::new(move |id, state| {
            a(id, state);
            b(id, state);
        })),
    }
}

/// Counter that tasks can wait on until it drops to zero.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    count: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    pub fn add(&self, n: usize) {
        self.count.send_modify(|count| *count += n);
    }

    /// Decrement by one. Saturates at zero.
    pub fn done(&self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until the count reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts HTTP/1 and HTTP/2-over-TLS connections that may still invoke the
/// handler.
///
/// Increments on [`ConnState::New`] and decrements on either terminal state.
/// Hijacked connections leave this count and are tracked by the h2c
/// coordinator instead.
#[derive(Debug, Clone, Default)]
pub struct LifecycleTracker {
    pending: WaitGroup,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook to register with the HTTP/1 engine.
    pub fn hook(&self) -> ConnStateHook {
        let pending = self.pending.clone();
        Arc::new(move |id, state| {
            match state {
                ConnState::New => pending.add(1),
                ConnState::Hijacked | ConnState::Closed => pending.done(),
            }
            tracing::trace!(connection_id = %id, state = ?state, pending = pending.count(), "Connection state changed");
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.count()
    }

    /// Wait until every tracked connection has closed or been hijacked.
    pub async fn wait(&self) {
        self.pending.wait().await
    }
}
