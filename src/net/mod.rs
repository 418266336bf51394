//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! socket.rs (StreamSocket / PacketSocket, one fresh listener per run)
//!     → listener.rs (accept loop source, idempotent close)
//!     → tls.rs (always-TLS, or sniff first byte → TLS | plaintext)
//!     → rewind.rs (replay the sniffed bytes)
//!     → Accepted { remote_addr, io } handed to an engine
//!
//! connection.rs:
//!     engine → ConnState { New → Hijacked | Closed } → LifecycleTracker
//! ```
//!
//! # Design Decisions
//! - Sockets are descriptors; listening happens inside each run
//! - TLS handshakes run on the connection task, never the accept loop
//! - Buffer reuse goes through an injected pool, not a global

pub mod connection;
pub mod listener;
pub mod pool;
pub mod rewind;
pub mod socket;
pub mod tls;

pub use connection::{
    combine_hooks, Carrier, ConnState, ConnStateHook, ConnectionId, ConnectionInfo, LifecycleTracker,
    Protocol, WaitGroup,
};
pub use listener::{Accepted, OnceCloseListener, StreamListener, TcpStreamListener, Transport};
pub use pool::BufferPool;
pub use rewind::Rewind;
pub use socket::{tcp, tcp_listener, udp, udp_socket, PacketSocket, StreamSocket};
pub use tls::{load_tls_config, optional_tls, tls, SniffFailure, TlsSocket};
