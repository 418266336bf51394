//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → options.rs (load certificates, build sockets, add the handler)
//!     → Options owned by one Server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; a server run never observes changes
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod options;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use options::Options;
pub use schema::{H1Config, H2Config, H3Config, ListenerConfig, ListenerKind, QuicConfig, ServerConfig};
