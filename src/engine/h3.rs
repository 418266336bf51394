//! HTTP/3 engine over QUIC.
//!
//! # Responsibilities
//! - Accept QUIC connections from one or more [`EarlyListener`]s
//! - Serve each request stream through the handler
//! - `shutdown`: GOAWAY on every connection, then wait for every
//!   connection and request task; close endpoints if the scope expires
//!
//! # Design Decisions
//! - One `TaskTracker` covers accept loops, connections and requests, so
//!   a finished wait means no handler call is still running
//! - Requests are spawned on the tracker before the handler is called

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, Bytes};
use futures_util::stream;
use h3::error::Code;
use h3::server::RequestStream;
use http::{Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::quic::{self, EarlyListener};
use crate::config::H3Config;
use crate::error::Error;
use crate::http::{body, Body, BoxError, Handler};
use crate::net::{Carrier, ConnectionId, ConnectionInfo, Protocol};
use crate::observability::metrics;

type H3Conn = h3::server::Connection<h3_quinn::Connection, Bytes>;
type SendHalf = RequestStream<h3_quinn::SendStream<Bytes>, Bytes>;
type RecvHalf = RequestStream<h3_quinn::RecvStream, Bytes>;

struct Inner {
    handler: Arc<dyn Handler>,
    config: H3Config,
    /// Cancelled when shutdown starts: stop accepting, send GOAWAY.
    closing: CancellationToken,
    /// Cancelled when connections must be dropped.
    kill: CancellationToken,
    tasks: TaskTracker,
    endpoints: Mutex<Vec<EarlyListener>>,
}

#[derive(Clone)]
pub struct H3Engine {
    inner: Arc<Inner>,
}

impl H3Engine {
    pub fn new(handler: Arc<dyn Handler>, config: H3Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                config,
                closing: CancellationToken::new(),
                kill: CancellationToken::new(),
                tasks: TaskTracker::new(),
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &H3Config {
        &self.inner.config
    }

    fn endpoints(&self) -> Vec<EarlyListener> {
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Accept and serve connections until shutdown or close. Returns
    /// [`Error::Closed`] once the engine stops accepting.
    pub async fn serve_listener(&self, listener: EarlyListener) -> Result<(), Error> {
        let _running = self.inner.tasks.token();
        if self.inner.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        self.inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener.clone());
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, "HTTP/3 engine accepting");
        }

        loop {
            let incoming = tokio::select! {
                _ = self.inner.closing.cancelled() => return Err(Error::Closed),
                incoming = listener.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                return Err(Error::Closed);
            };
            if self.inner.closing.is_cancelled() {
                incoming.refuse();
                return Err(Error::Closed);
            }
            let remote_addr = incoming.remote_address();
            let engine = self.clone();
            self.inner.tasks.spawn(async move {
                tokio::select! {
                    _ = engine.inner.kill.cancelled() => {}
                    _ = engine.serve_connection(incoming, remote_addr) => {}
                }
            });
        }
    }

    async fn serve_connection(&self, incoming: quinn::Incoming, remote_addr: SocketAddr) {
        let conn = match quic::establish(incoming).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(remote_addr = %remote_addr, error = %e, "QUIC handshake failed");
                return;
            }
        };
        let info = ConnectionInfo {
            id: ConnectionId::next(Carrier::Quic),
            remote_addr: Some(remote_addr),
            protocol: Protocol::Http3,
            tls: true,
        };
        metrics::connection_opened(Protocol::Http3);
        tracing::debug!(connection_id = %info.id, remote_addr = %remote_addr, "Serving HTTP/3 connection");

        match self.build(conn).await {
            Ok(h3) => self.accept_requests(h3, &info).await,
            Err(e) => tracing::debug!(connection_id = %info.id, error = %e, "HTTP/3 setup failed"),
        }

        metrics::connection_closed(Protocol::Http3);
        tracing::debug!(connection_id = %info.id, "HTTP/3 connection closed");
    }

    async fn build(&self, conn: quinn::Connection) -> Result<H3Conn, h3::Error> {
        let mut builder = h3::server::builder();
        if let Some(n) = self.inner.config.max_field_section_size {
            builder.max_field_section_size(n);
        }
        builder.enable_datagram(self.inner.config.enable_datagrams);
        builder.build(h3_quinn::Connection::new(conn)).await
    }

    async fn accept_requests(&self, mut conn: H3Conn, info: &ConnectionInfo) {
        let mut goaway_sent = false;
        loop {
            let closing = self.inner.closing.cancelled();
            let next = tokio::select! {
                _ = closing, if !goaway_sent => None,
                accepted = conn.accept() => Some(accepted),
            };
            let Some(accepted) = next else {
                goaway_sent = true;
                if let Err(e) = conn.shutdown(0).await {
                    tracing::debug!(connection_id = %info.id, error = %e, "HTTP/3 GOAWAY failed");
                    return;
                }
                continue;
            };

            match accepted {
                Ok(Some((req, stream))) => {
                    let engine = self.clone();
                    let info = info.clone();
                    self.inner.tasks.spawn(async move {
                        let kill = engine.inner.kill.clone();
                        tokio::select! {
                            _ = kill.cancelled() => {}
                            _ = engine.serve_request(req, stream, info) => {}
                        }
                    });
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(connection_id = %info.id, error = %e, "HTTP/3 connection ended");
                    return;
                }
            }
        }
    }

    async fn serve_request(
        &self,
        req: Request<()>,
        stream: RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
        info: ConnectionInfo,
    ) {
        let (mut send, recv) = stream.split();
        let (mut parts, ()) = req.into_parts();
        parts.extensions.insert(info.clone());
        let req = Request::from_parts(parts, request_body(recv));

        match self.inner.handler.call(req).await {
            Ok(res) => {
                if let Err(e) = send_response(&mut send, res).await {
                    tracing::debug!(connection_id = %info.id, error = %e, "HTTP/3 response failed");
                }
            }
            Err(e) => {
                tracing::debug!(connection_id = %info.id, error = %e, "HTTP/3 request aborted");
                send.stop_stream(Code::H3_REQUEST_CANCELLED);
            }
        }
    }

    /// Stop accepting, send GOAWAY on every connection and wait for every
    /// task. If `scope` is cancelled first the endpoints are closed, the
    /// remaining tasks dropped and [`Error::Cancelled`] returned.
    pub async fn shutdown(&self, scope: &CancellationToken) -> Result<(), Error> {
        self.inner.closing.cancel();
        for endpoint in self.endpoints() {
            endpoint.stop_accepting();
        }
        self.inner.tasks.close();
        tracing::debug!(tasks = self.inner.tasks.len(), "HTTP/3 graceful shutdown");

        tokio::select! {
            _ = self.inner.tasks.wait() => Ok(()),
            _ = scope.cancelled() => {
                self.close();
                self.inner.tasks.wait().await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Close every endpoint and drop every connection and request task.
    pub fn close(&self) {
        self.inner.closing.cancel();
        self.inner.kill.cancel();
        self.inner.tasks.close();
        for endpoint in self.endpoints() {
            endpoint.close();
        }
    }
}

fn request_body(recv: RecvHalf) -> Body {
    let frames = stream::unfold(Some(recv), |recv| async move {
        let mut recv = recv?;
        match recv.recv_data().await {
            Ok(Some(mut chunk)) => {
                let data = chunk.copy_to_bytes(chunk.remaining());
                Some((Ok(Frame::data(data)), Some(recv)))
            }
            Ok(None) => None,
            Err(e) => Some((Err(BoxError::from(e)), None)),
        }
    });
    body::boxed(StreamBody::new(frames))
}

async fn send_response(send: &mut SendHalf, res: Response<Body>) -> Result<(), BoxError> {
    let (parts, mut body) = res.into_parts();
    send.send_response(Response::from_parts(parts, ())).await?;
    while let Some(frame) = body.frame().await {
        match frame?.into_data() {
            Ok(data) => send.send_data(data).await?,
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    send.send_trailers(trailers).await?;
                    return Ok(());
                }
            }
        }
    }
    send.finish().await?;
    Ok(())
}
