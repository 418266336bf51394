//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Server::run
//!     → parallel.rs run_all: every runner starts, then one ready callback
//!     → runner.rs TcpRunner / QuicRunner per socket
//!         listen → serve in a task → ready → shutdown once per family
//!         → force close → close listener → join, combine errors
//!
//! Signals (signals.rs, used by the binary):
//!     SIGTERM/SIGINT → stop token (graceful)
//!     second signal or grace period → force token
//! ```
//!
//! # Design Decisions
//! - Shutdown of one protocol family runs once however many runners
//!   observe the trigger (shutdown.rs)
//! - Graceful shutdown is always bounded by the run's cancellation scope
//! - Forced close is attempted once more after every graceful shutdown

pub mod parallel;
pub mod runner;
pub mod shutdown;
pub mod signals;

pub use parallel::{run_all, ReadyCallback, Runnable};
pub use runner::{QuicRunner, TcpRunner};
pub use shutdown::ShutdownOnce;
pub use signals::shutdown_signals;
