//! Once `Server::run` returns the handler is idle and never called again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Request, Response, Version};
use polyserve::config::H1Config;
use polyserve::http::{body, grpc, handler_fn, Body};
use polyserve::{Error, Options, Server};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

mod common;

use common::{Recorder, BODY};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_handler_call_after_run_returns_on_any_protocol() {
    let recorder = Recorder::new();
    let cert = Arc::new(common::self_signed());
    let (plain, plain_addr) = common::plain_socket();
    let (optional, optional_addr) = common::optional_tls_socket(cert.server.clone());
    let (udp, udp_addr) = common::udp_socket();

    let options = Options::new(recorder.handler(Duration::ZERO))
        .with_stream_socket(plain)
        .with_stream_socket(optional)
        .with_packet_socket(udp)
        .with_h3_tls(cert.server.clone());
    let server = Server::new(options);

    let client_cert = cert.clone();
    server
        .run(&CancellationToken::new(), move |_| async move {
            let http1 = common::http1_get(plain_addr, "/").await.unwrap();
            assert!(http1.starts_with("HTTP/1.1 200"));

            let (version, text) = common::h2c_get(plain_addr, "/").await.unwrap();
            assert_eq!(version, Version::HTTP_2);
            assert_eq!(text, BODY);

            let (version, status, _) = common::tls_get(optional_addr, &client_cert, b"h2")
                .await
                .unwrap();
            assert_eq!((version, status.as_u16()), (Version::HTTP_2, 200));

            let (status, body) = common::h3_get(udp_addr, &client_cert, "/").await.unwrap();
            assert_eq!(status.as_u16(), 200);
            assert_eq!(&body[..], BODY.as_bytes());
            Ok(())
        })
        .await
        .unwrap();
    let returned = Instant::now();
    let calls = recorder.calls();
    assert_eq!(calls, 4);

    // Nothing serves the addresses any more.
    let late = Duration::from_millis(300);
    let _ = tokio::time::timeout(late, common::http1_get(plain_addr, "/")).await;
    let _ = tokio::time::timeout(late, common::h2c_get(optional_addr, "/")).await;
    let _ = tokio::time::timeout(late, common::h3_get(udp_addr, &cert, "/")).await;

    assert_eq!(recorder.calls(), calls);
    assert!(recorder.last_activity().unwrap() <= returned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_request_completes_before_run_returns() {
    let recorder = Recorder::new();
    let (socket, addr) = common::plain_socket();
    let server = Server::new(
        Options::new(recorder.handler(Duration::from_millis(300))).with_stream_socket(socket),
    );

    let entered = recorder.entered.clone();
    let (response_tx, response_rx) = tokio::sync::oneshot::channel();
    server
        .run(&CancellationToken::new(), move |_| async move {
            tokio::spawn(async move {
                let _ = response_tx.send(common::http1_get(addr, "/slow").await);
            });
            // Start shutting down while the handler is sleeping.
            entered.notified().await;
            Ok(())
        })
        .await
        .unwrap();
    let returned = Instant::now();

    assert_eq!(recorder.finished.lock().unwrap().len(), 1);
    assert!(recorder.last_activity().unwrap() <= returned);
    let response = response_rx.await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with(BODY));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_keep_alive_connection_is_closed_by_shutdown() {
    let recorder = Recorder::new();
    let (socket, addr) = common::plain_socket();
    let mut options = Options::new(recorder.handler(Duration::ZERO)).with_stream_socket(socket);
    // Neither timer may be the one that closes the connection.
    options.h1 = H1Config {
        read_header_timeout_ms: 30_000,
        idle_timeout_ms: 60_000,
        ..H1Config::default()
    };
    let server = Server::new(options);

    let scope = CancellationToken::new();
    let (stream_tx, stream_rx) = tokio::sync::oneshot::channel();
    let run = server.run(&scope, move |_| async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = common::http1_keep_alive_get(&mut stream, "/").await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        let _ = stream_tx.send(stream);
        Ok(())
    });
    tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("run returns without waiting for the idle connection")
        .unwrap();

    let mut stream = stream_rx.await.unwrap();
    assert!(common::closed_within(&mut stream, Duration::from_secs(1)).await);
    assert_eq!(recorder.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_scope_closes_stuck_connections() {
    let handler = handler_fn(|_req: Request<Body>| async {
        futures_util::future::pending::<()>().await;
        Ok(Response::new(body::empty()))
    });
    let (socket, addr) = common::plain_socket();
    let server = Server::new(Options::new(handler).with_stream_socket(socket));

    let scope = CancellationToken::new();
    let (response_tx, response_rx) = tokio::sync::oneshot::channel();
    let deadline = scope.clone();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        server.run(&scope, move |_| async move {
            tokio::spawn(async move {
                let _ = response_tx.send(common::http1_get(addr, "/stuck").await);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                deadline.cancel();
            });
            Ok(())
        }),
    )
    .await
    .expect("run returns once the scope expires");

    assert!(matches!(result, Err(ref e) if e.iter().any(|e| matches!(e, Error::Cancelled))));
    // The connection was closed without a response.
    let response = response_rx.await.unwrap().unwrap_or_default();
    assert!(response.is_empty());
}

#[tokio::test]
async fn grpc_requests_reach_the_grpc_handler() {
    fn named(name: &'static str) -> Arc<dyn polyserve::http::Handler> {
        handler_fn(move |_req: Request<Body>| async move { Ok(Response::new(body::full(name))) })
    }
    let (socket, addr) = common::plain_socket();
    let server = Server::new(
        Options::new(grpc(named("fallback"), named("grpc"))).with_stream_socket(socket),
    );

    server
        .run(&CancellationToken::new(), move |_| async move {
            let client = reqwest::Client::builder()
                .http2_prior_knowledge()
                .build()
                .unwrap();
            let url = format!("http://{addr}/pkg.Service/Method");

            let grpc = client
                .post(&url)
                .header("content-type", "application/grpc+proto")
                .send()
                .await
                .unwrap();
            assert_eq!(grpc.text().await.unwrap(), "grpc");

            let json = client
                .post(&url)
                .header("content-type", "application/json")
                .send()
                .await
                .unwrap();
            assert_eq!(json.text().await.unwrap(), "fallback");

            let http1 = common::http1_get(addr, "/pkg.Service/Method").await.unwrap();
            assert!(http1.ends_with("fallback"));
            Ok(())
        })
        .await
        .unwrap();
}
