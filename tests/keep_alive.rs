//! Kept-alive connections that go quiet are closed after the idle timeout.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Request;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::{TokioExecutor, TokioIo};
use polyserve::config::{H1Config, H2Config};
use polyserve::{Options, Server};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

mod common;

use common::{Recorder, BODY};

fn h1_idle(idle_timeout_ms: u64) -> H1Config {
    H1Config {
        idle_timeout_ms,
        read_header_timeout_ms: 10_000,
        ..H1Config::default()
    }
}

#[tokio::test]
async fn idle_http1_connection_is_closed() {
    let recorder = Recorder::new();
    let (socket, addr) = common::plain_socket();
    let mut options = Options::new(recorder.handler(Duration::ZERO)).with_stream_socket(socket);
    options.h1 = h1_idle(200);
    let server = Server::new(options);

    server
        .run(&CancellationToken::new(), move |_| async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let response = common::http1_keep_alive_get(&mut stream, "/").await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200"), "{response}");
            assert!(response.ends_with(BODY));

            let idle_since = Instant::now();
            assert!(common::closed_within(&mut stream, Duration::from_secs(5)).await);
            assert!(idle_since.elapsed() >= Duration::from_millis(150));
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(recorder.calls(), 1);
}

#[tokio::test]
async fn each_request_restarts_the_idle_clock() {
    let recorder = Recorder::new();
    let (socket, addr) = common::plain_socket();
    let mut options = Options::new(recorder.handler(Duration::ZERO)).with_stream_socket(socket);
    options.h1 = h1_idle(400);
    let server = Server::new(options);

    server
        .run(&CancellationToken::new(), move |_| async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for _ in 0..3 {
                let response = common::http1_keep_alive_get(&mut stream, "/").await.unwrap();
                assert!(response.starts_with("HTTP/1.1 200"), "{response}");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(recorder.calls(), 3);
}

#[tokio::test]
async fn disabled_idle_timeout_keeps_connection_open() {
    let recorder = Recorder::new();
    let (socket, addr) = common::plain_socket();
    let mut options = Options::new(recorder.handler(Duration::ZERO)).with_stream_socket(socket);
    options.h1 = h1_idle(0);
    let server = Server::new(options);

    server
        .run(&CancellationToken::new(), move |_| async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            common::http1_keep_alive_get(&mut stream, "/").await.unwrap();
            assert!(!common::closed_within(&mut stream, Duration::from_millis(500)).await);
            let response = common::http1_keep_alive_get(&mut stream, "/").await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200"));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn idle_http2_connection_is_sent_away() {
    let recorder = Recorder::new();
    let (socket, addr) = common::plain_socket();
    let mut options = Options::new(recorder.handler(Duration::ZERO)).with_stream_socket(socket);
    options.h2 = H2Config {
        idle_timeout_ms: 200,
        ..H2Config::default()
    };
    let server = Server::new(options);

    server
        .run(&CancellationToken::new(), move |_| async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (mut sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                    .await
                    .unwrap();
            let driver = tokio::spawn(conn);

            let request = Request::get(format!("http://{addr}/"))
                .body(Empty::<Bytes>::new())
                .unwrap();
            let response = sender.send_request(request).await.unwrap();
            assert_eq!(response.status().as_u16(), 200);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], BODY.as_bytes());

            let idle_since = Instant::now();
            let closed = tokio::time::timeout(Duration::from_secs(5), driver).await;
            assert!(closed.is_ok(), "connection still open");
            assert!(idle_since.elapsed() >= Duration::from_millis(150));
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(recorder.calls(), 1);
}
