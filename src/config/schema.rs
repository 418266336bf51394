//! Configuration schema definitions.
//!
//! Every field has a default so a minimal file works. Durations are plain
//! millisecond integers in files and exposed as [`Duration`] by accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for a server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub h1: H1Config,
    pub h2: H2Config,
    pub h3: H3Config,
    pub listeners: Vec<ListenerConfig>,
}

/// HTTP/1 engine options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct H1Config {
    /// Time allowed for the TLS handshake plus the first request head.
    pub read_header_timeout_ms: u64,

    pub keep_alive: bool,

    /// How long a kept-alive connection may wait for its next request;
    /// zero disables the limit.
    pub idle_timeout_ms: u64,

    /// Maximum buffer for request heads; hyper's default when unset.
    pub max_buf_size: Option<usize>,

    /// Maximum number of request headers; hyper's default when unset.
    pub max_headers: Option<usize>,

    /// Keep serving after the client half-closes its side.
    pub half_close: bool,
}

impl Default for H1Config {
    fn default() -> Self {
        Self {
            read_header_timeout_ms: 1000,
            keep_alive: true,
            idle_timeout_ms: 60_000,
            max_buf_size: None,
            max_headers: None,
            half_close: false,
        }
    }
}

impl H1Config {
    pub fn read_header_timeout(&self) -> Duration {
        Duration::from_millis(self.read_header_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// HTTP/2 engine options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct H2Config {
    /// Accept prior-knowledge cleartext HTTP/2 on plaintext connections.
    pub cleartext: bool,

    pub max_concurrent_streams: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub initial_stream_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
    pub max_header_list_size: Option<u32>,

    /// Ping interval; zero disables keep-alive pings.
    pub keep_alive_interval_ms: u64,

    /// How long to wait for a ping acknowledgement.
    pub keep_alive_timeout_ms: u64,

    /// Send GOAWAY after this long with no request in flight; zero
    /// disables it.
    pub idle_timeout_ms: u64,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            cleartext: true,
            max_concurrent_streams: None,
            max_frame_size: None,
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            max_header_list_size: None,
            keep_alive_interval_ms: 60_000,
            keep_alive_timeout_ms: 20_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl H2Config {
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// HTTP/3 engine options.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct H3Config {
    pub max_field_section_size: Option<u64>,

    /// Enable HTTP/3 datagrams; also turns on QUIC datagrams.
    pub enable_datagrams: bool,

    pub quic: QuicConfig,
}

/// QUIC transport options.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuicConfig {
    pub max_idle_timeout_ms: u64,
    pub keep_alive_interval_ms: Option<u64>,
    pub max_concurrent_bidi_streams: u32,
    pub max_concurrent_uni_streams: u32,
    pub datagram_receive_buffer_size: Option<usize>,
    pub enable_datagrams: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            max_idle_timeout_ms: 30_000,
            keep_alive_interval_ms: None,
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 100,
            datagram_receive_buffer_size: None,
            enable_datagrams: false,
        }
    }
}

impl QuicConfig {
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_ms.map(Duration::from_millis)
    }
}

/// Kind of listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    #[default]
    Tcp,
    Tls,
    OptionalTls,
    Quic,
}

impl ListenerKind {
    pub fn needs_tls(&self) -> bool {
        !matches!(self, ListenerKind::Tcp)
    }
}

/// One listening socket.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub kind: ListenerKind,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub address: String,

    /// Certificate chain (PEM), required for TLS and QUIC listeners.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,

    /// First-byte timeout for `optional_tls`; the default when unset or zero.
    pub sniff_timeout_ms: Option<u64>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            kind: ListenerKind::Tcp,
            address: "0.0.0.0:8080".to_string(),
            cert_path: None,
            key_path: None,
            sniff_timeout_ms: None,
        }
    }
}

impl ListenerConfig {
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [[listeners]]
            address = "127.0.0.1:8080"
            "#,
        )
        .unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].kind, ListenerKind::Tcp);
        assert_eq!(config.h1.read_header_timeout(), Duration::from_secs(1));
        assert!(config.h2.cleartext);
        assert_eq!(config.h2.keep_alive_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.h3.quic.max_idle_timeout_ms, 30_000);
        assert_eq!(config.h1.idle_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.h2.idle_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn parses_listener_kinds() {
        let config: ServerConfig = toml::from_str(
            r#"
            [h1]
            idle_timeout_ms = 0

            [h2]
            keep_alive_interval_ms = 0

            [[listeners]]
            kind = "optional_tls"
            address = "127.0.0.1:8443"
            cert_path = "cert.pem"
            key_path = "key.pem"
            sniff_timeout_ms = 20

            [[listeners]]
            kind = "quic"
            address = "127.0.0.1:8443"
            "#,
        )
        .unwrap();
        assert_eq!(config.listeners[0].kind, ListenerKind::OptionalTls);
        assert_eq!(config.listeners[0].sniff_timeout(), Duration::from_millis(20));
        assert_eq!(config.listeners[1].kind, ListenerKind::Quic);
        assert_eq!(config.h2.keep_alive_interval(), None);
        assert_eq!(config.h1.idle_timeout(), None);
    }
}
