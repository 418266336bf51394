//! TLS configuration, TLS sockets and the optional-TLS sniffing acceptor.
//!
//! # Responsibilities
//! - Load certificate chains and private keys from PEM
//! - Wrap a stream socket so every accepted connection speaks TLS
//! - Decide per connection between TLS and plaintext by sniffing the
//!   first byte
//!
//! # Design Decisions
//! - The sniff runs inside `accept`, so each accept can block for up to
//!   the sniff timeout. Do not put the optional acceptor on an always-on,
//!   externally facing endpoint under adversarial load.
//! - The handshake itself is deferred to the connection task through
//!   [`Accepted::io`]
//! - The sniffed byte is never lost: both outcomes replay it through
//!   [`Rewind`]

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::AsyncReadExt;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::listener::{Accepted, StreamListener, Transport};
use super::rewind::Rewind;
use super::socket::{self, StreamSocket};
use crate::error::Error;

/// TLS record type of a handshake message.
const TLS_HANDSHAKE_RECORD: u8 = 22;

/// Sniff timeout used when none (or a non-positive one) is configured.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(50);

/// What the optional-TLS acceptor assumes when the first byte cannot be
/// read in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SniffFailure {
    /// Wrap in TLS. A slow client most often already sent a handshake that
    /// missed the window, and an unusable connection fails either way.
    #[default]
    AssumeTls,
    AssumePlain,
}

impl<T: Transport> Transport for TlsStream<T> {
    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.get_ref().1.alpn_protocol().map(<[u8]>::to_vec)
    }

    fn is_tls(&self) -> bool {
        true
    }
}

/// Load TLS configuration from certificate and key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, Error> {
    if !cert_path.exists() {
        return Err(Error::Tls(format!(
            "certificate file not found: {}",
            cert_path.display()
        )));
    }
    if !key_path.exists() {
        return Err(Error::Tls(format!(
            "private key file not found: {}",
            key_path.display()
        )));
    }

    let certs = read_certs(&mut BufReader::new(File::open(cert_path)?))?;
    let key = read_key(&mut BufReader::new(File::open(key_path)?))?;
    build_server_config(certs, key)
}

/// Build a TLS configuration from in-memory PEM data.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>, Error> {
    let certs = read_certs(&mut io::Cursor::new(cert_pem))?;
    let key = read_key(&mut io::Cursor::new(key_pem))?;
    build_server_config(certs, key)
}

fn read_certs(reader: &mut dyn io::BufRead) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates found".into()));
    }
    Ok(certs)
}

fn read_key(reader: &mut dyn io::BufRead) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| Error::Tls(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| Error::Tls("no private key found".into()))
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, Error> {
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Advertise `h2` and `http/1.1` when the configuration sets no ALPN
/// protocols. rustls rejects clients whose offer does not overlap, so
/// `http/1.1` stays next to `h2`.
pub fn with_default_alpn(config: Arc<ServerConfig>) -> Arc<ServerConfig> {
    if !config.alpn_protocols.is_empty() {
        return config;
    }
    let mut config = (*config).clone();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// TCP socket whose connections are all TLS.
pub fn tls(address: impl Into<String>, config: Arc<ServerConfig>) -> Arc<dyn StreamSocket> {
    Arc::new(TlsSocket::wrap(socket::tcp(address), config))
}

/// TCP socket that sniffs each connection and serves TLS or plaintext.
pub fn optional_tls(
    address: impl Into<String>,
    config: Arc<ServerConfig>,
    sniff_timeout: Duration,
) -> Arc<dyn StreamSocket> {
    Arc::new(TlsSocket::optional(
        socket::tcp(address),
        config,
        sniff_timeout,
        SniffFailure::default(),
    ))
}

#[derive(Debug, Clone, Copy)]
enum TlsMode {
    Always,
    Optional {
        sniff_timeout: Duration,
        on_failure: SniffFailure,
    },
}

/// Wraps any stream socket with TLS, always or after sniffing.
pub struct TlsSocket {
    inner: Arc<dyn StreamSocket>,
    config: Arc<ServerConfig>,
    mode: TlsMode,
}

impl TlsSocket {
    pub fn wrap(inner: Arc<dyn StreamSocket>, config: Arc<ServerConfig>) -> Self {
        Self {
            inner,
            config: with_default_alpn(config),
            mode: TlsMode::Always,
        }
    }

    pub fn optional(
        inner: Arc<dyn StreamSocket>,
        config: Arc<ServerConfig>,
        sniff_timeout: Duration,
        on_failure: SniffFailure,
    ) -> Self {
        let sniff_timeout = if sniff_timeout.is_zero() {
            DEFAULT_SNIFF_TIMEOUT
        } else {
            sniff_timeout
        };
        Self {
            inner,
            config: with_default_alpn(config),
            mode: TlsMode::Optional {
                sniff_timeout,
                on_failure,
            },
        }
    }
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("inner", &self.inner)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl StreamSocket for TlsSocket {
    fn listen<'a>(
        &'a self,
        scope: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Box<dyn StreamListener>, Error>> {
        Box::pin(async move {
            let inner = self.inner.listen(scope).await?;
            Ok(Box::new(TlsListener {
                inner,
                acceptor: TlsAcceptor::from(self.config.clone()),
                mode: self.mode,
            }) as Box<dyn StreamListener>)
        })
    }
}

struct TlsListener {
    inner: Box<dyn StreamListener>,
    acceptor: TlsAcceptor,
    mode: TlsMode,
}

impl StreamListener for TlsListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<Accepted>> {
        Box::pin(async move {
            let accepted = self.inner.accept().await?;
            let remote_addr = accepted.remote_addr;
            match self.mode {
                TlsMode::Always => Ok(Accepted {
                    remote_addr,
                    io: handshake(self.acceptor.clone(), accepted.io),
                }),
                TlsMode::Optional {
                    sniff_timeout,
                    on_failure,
                } => {
                    let io = accepted.io.await?;
                    match sniff(io, sniff_timeout, on_failure).await {
                        Sniffed::Tls(io) => {
                            tracing::trace!(peer_addr = ?remote_addr, "Sniffed TLS connection");
                            let io: BoxFuture<'static, io::Result<Box<dyn Transport>>> =
                                Box::pin(async move { Ok(Box::new(io) as Box<dyn Transport>) });
                            Ok(Accepted {
                                remote_addr,
                                io: handshake(self.acceptor.clone(), io),
                            })
                        }
                        Sniffed::Plain(io) => {
                            tracing::trace!(peer_addr = ?remote_addr, "Sniffed plaintext connection");
                            Ok(Accepted::ready(io, remote_addr))
                        }
                    }
                }
            }
        })
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }

    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }
}

fn handshake(
    acceptor: TlsAcceptor,
    io: BoxFuture<'static, io::Result<Box<dyn Transport>>>,
) -> BoxFuture<'static, io::Result<Box<dyn Transport>>> {
    Box::pin(async move {
        let io = io.await?;
        let stream = acceptor.accept(io).await?;
        Ok(Box::new(stream) as Box<dyn Transport>)
    })
}

/// Outcome of sniffing, both holding the consumed byte for replay.
enum Sniffed {
    Tls(Rewind<Box<dyn Transport>>),
    Plain(Rewind<Box<dyn Transport>>),
}

async fn sniff(mut io: Box<dyn Transport>, timeout: Duration, on_failure: SniffFailure) -> Sniffed {
    let mut byte = [0u8; 1];
    let first = match tokio::time::timeout(timeout, io.read(&mut byte)).await {
        Ok(Ok(1)) => Some(byte[0]),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Sniff read failed");
            None
        }
        Err(_) => None,
    };
    let prefix = first.map(|b| Bytes::copy_from_slice(&[b])).unwrap_or_default();
    let io = Rewind::new(io, prefix);
    match first {
        Some(TLS_HANDSHAKE_RECORD) => Sniffed::Tls(io),
        Some(_) => Sniffed::Plain(io),
        None => match on_failure {
            SniffFailure::AssumeTls => Sniffed::Tls(io),
            SniffFailure::AssumePlain => Sniffed::Plain(io),
        },
    }
}
