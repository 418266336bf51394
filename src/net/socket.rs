//! Socket descriptors that produce a fresh listener per run.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::listener::{StreamListener, TcpStreamListener};
use crate::error::Error;

/// Produces a listening stream endpoint.
pub trait StreamSocket: Send + Sync + fmt::Debug {
    fn listen<'a>(
        &'a self,
        scope: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Box<dyn StreamListener>, Error>>;
}

/// Produces a bound UDP socket for QUIC.
pub trait PacketSocket: Send + Sync + fmt::Debug {
    fn listen<'a>(
        &'a self,
        scope: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<std::net::UdpSocket, Error>>;
}

/// Plain TCP socket bound on every `listen`.
pub fn tcp(address: impl Into<String>) -> Arc<dyn StreamSocket> {
    Arc::new(TcpSocket {
        address: address.into(),
    })
}

/// UDP socket bound on every `listen`.
pub fn udp(address: impl Into<String>) -> Arc<dyn PacketSocket> {
    Arc::new(UdpSocket {
        address: address.into(),
    })
}

/// Serve an already bound TCP listener. Each `listen` uses a duplicate of
/// the descriptor.
pub fn tcp_listener(listener: std::net::TcpListener) -> Arc<dyn StreamSocket> {
    Arc::new(BoundTcpSocket { listener })
}

/// Serve an already bound UDP socket.
pub fn udp_socket(socket: std::net::UdpSocket) -> Arc<dyn PacketSocket> {
    Arc::new(BoundUdpSocket { socket })
}

fn check_scope(scope: &CancellationToken) -> Result<(), Error> {
    if scope.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

#[derive(Debug)]
struct TcpSocket {
    address: String,
}

impl StreamSocket for TcpSocket {
    fn listen<'a>(
        &'a self,
        scope: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Box<dyn StreamListener>, Error>> {
        Box::pin(async move {
            check_scope(scope)?;
            let listener = TcpListener::bind(&self.address)
                .await
                .map_err(|source| Error::Listen {
                    address: self.address.clone(),
                    source,
                })?;
            if let Ok(local_addr) = listener.local_addr() {
                tracing::debug!(address = %local_addr, "TCP socket bound");
            }
            Ok(Box::new(TcpStreamListener::new(listener)) as Box<dyn StreamListener>)
        })
    }
}

#[derive(Debug)]
struct BoundTcpSocket {
    listener: std::net::TcpListener,
}

impl StreamSocket for BoundTcpSocket {
    fn listen<'a>(
        &'a self,
        scope: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Box<dyn StreamListener>, Error>> {
        Box::pin(async move {
            check_scope(scope)?;
            let address = self
                .listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default();
            let listen_err = |source| Error::Listen {
                address: address.clone(),
                source,
            };
            let std_listener = self.listener.try_clone().map_err(listen_err)?;
            std_listener.set_nonblocking(true).map_err(listen_err)?;
            let listener = TcpListener::from_std(std_listener).map_err(listen_err)?;
            Ok(Box::new(TcpStreamListener::new(listener)) as Box<dyn StreamListener>)
        })
    }
}

#[derive(Debug)]
struct UdpSocket {
    address: String,
}

impl PacketSocket for UdpSocket {
    fn listen<'a>(
        &'a self,
        scope: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<std::net::UdpSocket, Error>> {
        Box::pin(async move {
            check_scope(scope)?;
            let listen_err = |source| Error::Listen {
                address: self.address.clone(),
                source,
            };
            let socket = tokio::net::UdpSocket::bind(&self.address)
                .await
                .map_err(listen_err)?;
            socket.into_std().map_err(listen_err)
        })
    }
}

#[derive(Debug)]
struct BoundUdpSocket {
    socket: std::net::UdpSocket,
}

impl PacketSocket for BoundUdpSocket {
    fn listen<'a>(
        &'a self,
        scope: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<std::net::UdpSocket, Error>> {
        Box::pin(async move {
            check_scope(scope)?;
            self.socket.try_clone().map_err(|source| Error::Listen {
                address: self
                    .socket
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                source,
            })
        })
    }
}
