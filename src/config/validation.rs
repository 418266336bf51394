//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check listener addresses and TLS material
//! - Validate value ranges the engines would reject at runtime
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::{ListenerKind, ServerConfig};

const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;
const MIN_BUF_SIZE: usize = 8192;

/// A single semantic rule violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// `host:port` with a non-empty host and a numeric port. Hostnames are
/// resolved when the socket binds, not here.
fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (i, listener) in config.listeners.iter().enumerate() {
        let field = format!("listeners[{i}]");
        if listener.address.trim().is_empty() {
            errors.push(ValidationError::new(format!("{field}.address"), "must not be empty"));
        } else if !is_host_port(&listener.address) {
            errors.push(ValidationError::new(
                format!("{field}.address"),
                format!("expected host:port, got '{}'", listener.address),
            ));
        }
        if listener.kind.needs_tls() {
            if listener.cert_path.is_none() {
                errors.push(ValidationError::new(format!("{field}.cert_path"), "required for TLS"));
            }
            if listener.key_path.is_none() {
                errors.push(ValidationError::new(format!("{field}.key_path"), "required for TLS"));
            }
        }
        if listener.sniff_timeout_ms.is_some() && listener.kind != ListenerKind::OptionalTls {
            errors.push(ValidationError::new(
                format!("{field}.sniff_timeout_ms"),
                "only applies to optional_tls listeners",
            ));
        }
    }

    if let Some(size) = config.h2.max_frame_size {
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
            errors.push(ValidationError::new(
                "h2.max_frame_size",
                format!("must be within {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}"),
            ));
        }
    }
    if let Some(size) = config.h1.max_buf_size {
        if size < MIN_BUF_SIZE {
            errors.push(ValidationError::new(
                "h1.max_buf_size",
                format!("must be at least {MIN_BUF_SIZE}"),
            ));
        }
    }
    if config.h1.read_header_timeout_ms == 0 {
        errors.push(ValidationError::new("h1.read_header_timeout_ms", "must be positive"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ListenerConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn accepts_hostname_and_ipv6_addresses() {
        let mut config = ServerConfig::default();
        for address in ["localhost:8080", "api.internal:443", "[::1]:8443", "0.0.0.0:80"] {
            config.listeners.push(ListenerConfig {
                address: address.into(),
                ..Default::default()
            });
        }
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn rejects_addresses_without_a_port() {
        for address in ["localhost", "localhost:http", ":8080", "localhost:70000"] {
            let config = ServerConfig {
                listeners: vec![ListenerConfig {
                    address: address.into(),
                    ..Default::default()
                }],
                ..Default::default()
            };
            let errors = validate_config(&config).unwrap_err();
            assert_eq!(errors[0].field, "listeners[0].address", "{address}");
        }
    }

    #[test]
    fn reports_every_violation() {
        let mut config = ServerConfig::default();
        config.listeners.push(ListenerConfig {
            kind: ListenerKind::Tls,
            address: "".into(),
            ..Default::default()
        });
        config.listeners.push(ListenerConfig {
            kind: ListenerKind::Tcp,
            address: "localhost".into(),
            sniff_timeout_ms: Some(10),
            ..Default::default()
        });
        config.h2.max_frame_size = Some(1024);
        config.h1.max_buf_size = Some(100);

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listeners[0].address",
                "listeners[0].cert_path",
                "listeners[0].key_path",
                "listeners[1].address",
                "listeners[1].sniff_timeout_ms",
                "h2.max_frame_size",
                "h1.max_buf_size",
            ]
        );
    }
}
