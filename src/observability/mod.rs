//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (connection_id, address, error)
//!     → metrics.rs (connection gauges, abort and upgrade counters)
//!
//! Consumers (installed by the binary only):
//!     → logging.rs (fmt subscriber + EnvFilter)
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - The library never installs a subscriber or recorder
//! - Metric updates are cheap facade calls, no-ops when nothing listens

pub mod logging;
pub mod metrics;
