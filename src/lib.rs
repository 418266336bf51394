//! Multi-protocol HTTP server with a single shutdown guarantee.
//!
//! One [`Server`] serves HTTP/1, HTTP/2 (TLS-negotiated and cleartext
//! prior-knowledge) and HTTP/3 over any number of sockets. Once
//! [`Server::run`] returns, the handler has no call in flight and is never
//! called again.

// Core subsystems
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod net;

// Operations
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::Options;
pub use error::Error;
pub use http::Server;
