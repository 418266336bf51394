//! QUIC endpoint that accepts connections before their handshake completes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use quinn::{Connection, EndpointConfig, IdleTimeout, Incoming, TokioRuntime, TransportConfig, VarInt};

use crate::config::QuicConfig;
use crate::error::Error;

const H3_ALPN: &[u8] = b"h3";

/// Listener over one UDP socket handing out connections in 0.5-RTT, so
/// request streams can be accepted while the handshake is still finishing.
#[derive(Clone, Debug)]
pub struct EarlyListener {
    endpoint: quinn::Endpoint,
}

impl EarlyListener {
    pub fn bind(
        socket: std::net::UdpSocket,
        tls: &Arc<rustls::ServerConfig>,
        config: &QuicConfig,
    ) -> Result<Self, Error> {
        let mut crypto = (**tls).clone();
        crypto.alpn_protocols = vec![H3_ALPN.to_vec()];
        crypto.max_early_data_size = u32::MAX;
        let crypto = QuicServerConfig::try_from(crypto)
            .map_err(|e| Error::Tls(format!("TLS config unusable for QUIC: {e}")))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport_config(config)?));

        let endpoint = quinn::Endpoint::new(
            EndpointConfig::default(),
            Some(server_config),
            socket,
            Arc::new(TokioRuntime),
        )?;
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Next incoming connection attempt, `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Refuse new connections; established ones keep running.
    pub fn stop_accepting(&self) {
        self.endpoint.set_server_config(None);
    }

    /// Close every connection immediately.
    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"server closed");
    }
}

/// Finish accepting `incoming`, returning as soon as 0.5-RTT data can flow.
pub(crate) async fn establish(incoming: Incoming) -> Result<Connection, quinn::ConnectionError> {
    let connecting = incoming.accept()?;
    match connecting.into_0rtt() {
        Ok((conn, _accepted)) => Ok(conn),
        Err(connecting) => connecting.await,
    }
}

fn transport_config(config: &QuicConfig) -> Result<TransportConfig, Error> {
    let mut transport = TransportConfig::default();
    let idle = IdleTimeout::try_from(Duration::from_millis(config.max_idle_timeout_ms))
        .map_err(|e| Error::Config(format!("quic.max_idle_timeout_ms: {e}")))?;
    transport
        .max_idle_timeout(Some(idle))
        .keep_alive_interval(config.keep_alive_interval())
        .max_concurrent_bidi_streams(VarInt::from_u32(config.max_concurrent_bidi_streams))
        .max_concurrent_uni_streams(VarInt::from_u32(config.max_concurrent_uni_streams));
    if config.enable_datagrams {
        transport.datagram_receive_buffer_size(Some(
            config
                .datagram_receive_buffer_size
                .unwrap_or(DEFAULT_DATAGRAM_BUFFER),
        ));
    } else {
        transport.datagram_receive_buffer_size(None);
    }
    Ok(transport)
}

const DEFAULT_DATAGRAM_BUFFER: usize = 1024 * 1024;
