//! Runtime server options.
//!
//! File configuration covers engine limits and listeners. The handler,
//! hooks, HTTP/3 TLS configuration and buffer pool only exist at runtime.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::schema::{H1Config, H2Config, H3Config, ListenerKind, ServerConfig};
use crate::error::Error;
use crate::http::{not_found, Handler};
use crate::net::{self, BufferPool, ConnStateHook, PacketSocket, StreamSocket};

/// Everything one [`crate::Server`] needs.
#[derive(Clone)]
pub struct Options {
    pub h1: H1Config,
    pub h2: H2Config,
    pub h3: H3Config,

    /// Called for every request on every protocol.
    pub handler: Arc<dyn Handler>,

    /// Extra HTTP/1 connection state hook, called after the lifecycle
    /// tracker's own.
    pub conn_state: Option<ConnStateHook>,

    /// Required when any packet socket is configured.
    pub h3_tls: Option<Arc<rustls::ServerConfig>>,

    /// Pool for pre-dispatch reads; a fresh one per server when unset.
    pub buffer_pool: Option<BufferPool>,

    pub stream_sockets: Vec<Arc<dyn StreamSocket>>,
    pub packet_sockets: Vec<Arc<dyn PacketSocket>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            h1: H1Config::default(),
            h2: H2Config::default(),
            h3: H3Config::default(),
            handler: not_found(),
            conn_state: None,
            h3_tls: None,
            buffer_pool: None,
            stream_sockets: Vec::new(),
            packet_sockets: Vec::new(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("h1", &self.h1)
            .field("h2", &self.h2)
            .field("h3", &self.h3)
            .field("stream_sockets", &self.stream_sockets)
            .field("packet_sockets", &self.packet_sockets)
            .field("h3_tls", &self.h3_tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            ..Self::default()
        }
    }

    pub fn with_stream_socket(mut self, socket: Arc<dyn StreamSocket>) -> Self {
        self.stream_sockets.push(socket);
        self
    }

    pub fn with_packet_socket(mut self, socket: Arc<dyn PacketSocket>) -> Self {
        self.packet_sockets.push(socket);
        self
    }

    pub fn with_h3_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.h3_tls = Some(config);
        self
    }

    pub fn with_conn_state(mut self, hook: ConnStateHook) -> Self {
        self.conn_state = Some(hook);
        self
    }

    pub fn with_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// Build options from a validated file configuration. Certificates are
    /// loaded here; all QUIC listeners must share one certificate.
    pub fn from_config(config: &ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, Error> {
        let mut options = Self {
            h1: config.h1.clone(),
            h2: config.h2.clone(),
            h3: config.h3.clone(),
            ..Self::new(handler)
        };
        let mut quic_cert: Option<(&str, &str)> = None;

        for listener in &config.listeners {
            let address = listener.address.clone();
            let material = match (&listener.cert_path, &listener.key_path) {
                (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
                _ => None,
            };
            let tls = || -> Result<Arc<rustls::ServerConfig>, Error> {
                let (cert, key) = material.ok_or_else(|| {
                    Error::Config(format!("listener {address} requires cert_path and key_path"))
                })?;
                net::load_tls_config(Path::new(cert), Path::new(key))
            };

            match listener.kind {
                ListenerKind::Tcp => options.stream_sockets.push(net::tcp(address.clone())),
                ListenerKind::Tls => options.stream_sockets.push(net::tls(address.clone(), tls()?)),
                ListenerKind::OptionalTls => options.stream_sockets.push(net::optional_tls(
                    address.clone(),
                    tls()?,
                    listener.sniff_timeout(),
                )),
                ListenerKind::Quic => {
                    match (quic_cert, material) {
                        (None, _) => {
                            options.h3_tls = Some(tls()?);
                            quic_cert = material;
                        }
                        (Some(first), Some(this)) if first != this => {
                            return Err(Error::Config(format!(
                                "QUIC listener {address} must use the same certificate as the other QUIC listeners"
                            )));
                        }
                        _ => {}
                    }
                    options.packet_sockets.push(net::udp(address.clone()));
                }
            }
        }
        Ok(options)
    }
}
