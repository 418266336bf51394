//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use http::{Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::{TokioExecutor, TokioIo};
use polyserve::http::{body, handler_fn, Body, Handler};
use polyserve::net::{self, PacketSocket, SniffFailure, StreamSocket, TlsSocket};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;

pub const BODY: &str = "hello from polyserve";

/// Handler that records when each call started and finished.
#[derive(Clone, Default)]
pub struct Recorder {
    pub started: Arc<Mutex<Vec<Instant>>>,
    pub finished: Arc<Mutex<Vec<Instant>>>,
    pub entered: Arc<Notify>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with [`BODY`] after `delay`.
    pub fn handler(&self, delay: Duration) -> Arc<dyn Handler> {
        let recorder = self.clone();
        handler_fn(move |_req: Request<Body>| {
            let recorder = recorder.clone();
            async move {
                recorder.started.lock().unwrap().push(Instant::now());
                recorder.entered.notify_one();
                tokio::time::sleep(delay).await;
                recorder.finished.lock().unwrap().push(Instant::now());
                Ok(Response::new(body::full(BODY)))
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn last_activity(&self) -> Option<Instant> {
        let started = self.started.lock().unwrap().iter().max().copied();
        let finished = self.finished.lock().unwrap().iter().max().copied();
        started.max(finished)
    }
}

pub fn plain_socket() -> (Arc<dyn StreamSocket>, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (net::tcp_listener(listener), addr)
}

pub fn optional_tls_socket(tls: Arc<rustls::ServerConfig>) -> (Arc<dyn StreamSocket>, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let socket = TlsSocket::optional(
        net::tcp_listener(listener),
        tls,
        Duration::from_millis(200),
        SniffFailure::AssumeTls,
    );
    (Arc::new(socket), addr)
}

pub fn udp_socket() -> (Arc<dyn PacketSocket>, SocketAddr) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    (net::udp_socket(socket), addr)
}

/// Self-signed certificate for `localhost`.
pub struct TestCert {
    pub server: Arc<rustls::ServerConfig>,
    pub der: CertificateDer<'static>,
}

pub fn self_signed() -> TestCert {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let server = net::tls::server_config_from_pem(
        certified.cert.pem().as_bytes(),
        certified.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();
    TestCert {
        server,
        der: certified.cert.der().clone(),
    }
}

pub fn client_tls(cert: &TestCert, alpn: &[&[u8]]) -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.der.clone()).unwrap();
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config
}

/// Plaintext HTTP/1.1 GET over a raw socket. Returns the whole response.
pub async fn http1_get(addr: SocketAddr, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send one HTTP/1.1 GET on a kept-alive `stream` and read exactly one
/// response, leaving the connection open.
pub async fn http1_keep_alive_get(stream: &mut TcpStream, path: &str) -> std::io::Result<String> {
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut expected = None;
    loop {
        if expected.is_none() {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).into_owned();
                let length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                expected = Some(end + 4 + length);
            }
        }
        if matches!(expected, Some(total) if buf.len() >= total) {
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Whether the server closes `stream` within `within`.
pub async fn closed_within(stream: &mut TcpStream, within: Duration) -> bool {
    let mut byte = [0u8; 1];
    matches!(
        tokio::time::timeout(within, stream.read(&mut byte)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

/// Prior-knowledge cleartext HTTP/2 GET.
pub async fn h2c_get(addr: SocketAddr, path: &str) -> reqwest::Result<(Version, String)> {
    let client = reqwest::Client::builder().http2_prior_knowledge().build()?;
    let response = client.get(format!("http://{addr}{path}")).send().await?;
    let version = response.version();
    Ok((version, response.text().await?))
}

/// GET over TLS with the given ALPN protocol (`h2` or `http/1.1`).
pub async fn tls_get(
    addr: SocketAddr,
    cert: &TestCert,
    alpn: &'static [u8],
) -> Result<(Version, StatusCode, Bytes), Box<dyn std::error::Error + Send + Sync>> {
    let connector = TlsConnector::from(Arc::new(client_tls(cert, &[alpn])));
    let tcp = TcpStream::connect(addr).await?;
    let tls = connector
        .connect(ServerName::try_from("localhost")?, tcp)
        .await?;
    let io = TokioIo::new(tls);

    let request = Request::builder()
        .uri(format!("https://localhost:{}/", addr.port()))
        .body(Empty::<Bytes>::new())?;
    let response = if alpn == b"h2" {
        let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io).await?;
        tokio::spawn(conn);
        sender.send_request(request).await?
    } else {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(conn);
        sender.send_request(request).await?
    };
    let version = response.version();
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((version, status, body))
}

/// HTTP/3 GET.
pub async fn h3_get(
    addr: SocketAddr,
    cert: &TestCert,
    path: &str,
) -> Result<(StatusCode, Bytes), Box<dyn std::error::Error + Send + Sync>> {
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(client_tls(cert, &[b"h3"]))?;
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse()?)?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

    let conn = endpoint.connect(addr, "localhost")?.await?;
    let (mut driver, mut sender) = h3::client::new(h3_quinn::Connection::new(conn)).await?;
    let driving = tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let request = Request::get(format!("https://localhost:{}{path}", addr.port())).body(())?;
    let mut stream = sender.send_request(request).await?;
    stream.finish().await?;
    let response = stream.recv_response().await?;
    let mut body = Vec::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        let bytes = chunk.copy_to_bytes(chunk.remaining());
        body.extend_from_slice(&bytes);
    }

    drop(sender);
    endpoint.close(0u32.into(), b"done");
    driving.abort();
    Ok((response.status(), Bytes::from(body)))
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
