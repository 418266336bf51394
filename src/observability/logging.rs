//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber for the binary
//! - Configure log level from the environment
//!
//! # Design Decisions
//! - The library only emits events; installing a subscriber is the
//!   host's call
//! - `RUST_LOG` wins over the built-in default filter

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "polyserve=info,tower_http=info";

/// Install a global fmt subscriber filtered by `RUST_LOG` or `default_filter`.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}
