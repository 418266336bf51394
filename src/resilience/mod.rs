//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! engine accept loop:
//!     → accept error
//!     → backoff.rs (transient? sleep 5ms, 10ms, ... capped at 1s, retry)
//!     → otherwise end the serve loop with the error
//! ```
//!
//! # Design Decisions
//! - Only accept failures are retried; connection-level errors end that
//!   connection and nothing else

pub mod backoff;
