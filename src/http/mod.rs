//! Request handling and the server orchestrator.
//!
//! # Data Flow
//! ```text
//! engine request
//!     → h2c.rs (HTTP/1 engine only: upgrade prior-knowledge connections)
//!     → fail_fast.rs (handler failure becomes a fatal server error)
//!     → abort.rs (refuse calls after stop, count in-flight calls)
//!     → user handler (optionally grpc.rs routing)
//! ```
//!
//! # Design Decisions
//! - One [`Handler`] trait for every protocol; bodies are type-erased
//! - [`Server::run`] returns only after the handler has been stopped

pub mod abort;
pub mod body;
pub mod fail_fast;
pub mod grpc;
pub mod h2c;
pub mod handler;
pub mod server;

pub use abort::AbortGate;
pub use body::{Body, BoxError};
pub use fail_fast::{FailFast, FatalSlot};
pub use grpc::{grpc, is_grpc_request};
pub use h2c::H2cHandler;
pub use handler::{from_service, handler_fn, not_found, Handler, HandlerError, HandlerFuture};
pub use server::Server;
