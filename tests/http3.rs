//! HTTP/3 over QUIC.

use std::sync::Arc;
use std::time::Duration;

use polyserve::{Error, Options, Server};
use tokio_util::sync::CancellationToken;

mod common;

use common::{Recorder, BODY};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serves_requests_over_quic() {
    let recorder = Recorder::new();
    let cert = Arc::new(common::self_signed());
    let (udp, addr) = common::udp_socket();
    let server = Server::new(
        Options::new(recorder.handler(Duration::ZERO))
            .with_packet_socket(udp)
            .with_h3_tls(cert.server.clone()),
    );

    server
        .run(&CancellationToken::new(), move |_| async move {
            for path in ["/", "/a", "/b"] {
                let (status, body) = common::h3_get(addr, &cert, path).await.unwrap();
                assert_eq!(status.as_u16(), 200);
                assert_eq!(&body[..], BODY.as_bytes());
            }
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(recorder.calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_http3_request_completes_during_shutdown() {
    let recorder = Recorder::new();
    let cert = Arc::new(common::self_signed());
    let (udp, addr) = common::udp_socket();
    let server = Server::new(
        Options::new(recorder.handler(Duration::from_millis(300)))
            .with_packet_socket(udp)
            .with_h3_tls(cert.server.clone()),
    );

    let entered = recorder.entered.clone();
    let (response_tx, response_rx) = tokio::sync::oneshot::channel();
    server
        .run(&CancellationToken::new(), move |_| async move {
            tokio::spawn(async move {
                let _ = response_tx.send(common::h3_get(addr, &cert, "/slow").await);
            });
            entered.notified().await;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(recorder.finished.lock().unwrap().len(), 1);
    let (status, body) = response_rx.await.unwrap().unwrap();
    assert_eq!(status.as_u16(), 200);
    assert_eq!(&body[..], BODY.as_bytes());
}

#[tokio::test]
async fn packet_socket_without_tls_fails_the_run() {
    let (udp, _) = common::udp_socket();
    let (plain, _) = common::plain_socket();
    let server = Server::new(
        Options::new(Recorder::new().handler(Duration::ZERO))
            .with_stream_socket(plain)
            .with_packet_socket(udp),
    );

    let err = server
        .run(&CancellationToken::new(), |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.iter().any(|e| matches!(e, Error::Config(_))));
}
