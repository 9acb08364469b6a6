//! HTTP/1.1 upgrade and CONNECT tunnels.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use unified_http_server::http::{PathFormat, ResponseBody, ResponseHead, Transport};
use unified_http_server::{ListenerSpec, NormalizedRequest, Server};

mod common;

/// `echo` upgrades are accepted and echoed; `peek` reads before answering
/// and then echoes; anything else is refused.
async fn tunnel_handler(req: NormalizedRequest) {
    let result = match (req.transport(), req.head().get(":protocol")) {
        (Transport::Http1Tunnel, Some("peek")) => {
            let mut body = req.take_body().expect("body taken once");
            let early = tokio::time::timeout(Duration::from_millis(500), body.next()).await;
            let outcome = match early {
                Ok(Some(Err(e))) if e.kind() == io::ErrorKind::NotConnected => "refused",
                Ok(_) => "other",
                Err(_) => "hung",
            };
            req.respond(
                ResponseBody::from(body),
                ResponseHead::new(StatusCode::SWITCHING_PROTOCOLS).header("x-early-read", outcome),
            )
        }
        (Transport::Http1Tunnel, Some("echo")) => {
            let body = req.take_body().expect("body taken once");
            req.respond(
                ResponseBody::from(body),
                ResponseHead::new(StatusCode::SWITCHING_PROTOCOLS),
            )
        }
        (Transport::Http1Tunnel, Some(_)) => req.respond("denied", StatusCode::FORBIDDEN),
        (Transport::Http1Tunnel, None) => {
            let body = format!(
                "{:?} {} {}",
                req.path_format(),
                req.path().unwrap_or("-"),
                req.method()
            );
            req.respond(body, ())
        }
        _ => req.respond("plain", ()),
    };
    result.unwrap();
}

async fn start() -> (Arc<Server>, TcpStream) {
    let server = Server::new(vec![ListenerSpec::http("127.0.0.1", 0).with_id("t")], tunnel_handler).unwrap();
    server.listen().await.unwrap();
    let stream = TcpStream::connect(server.local_addr("t").unwrap()).await.unwrap();
    (Arc::new(server), stream)
}

async fn upgrade(stream: &mut TcpStream, protocol: &str) -> String {
    let request = format!(
        "GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: {protocol}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    common::read_until(stream, "\r\n\r\n").await
}

#[tokio::test]
async fn accepted_upgrade_echoes() {
    let (server, mut stream) = start().await;

    let head = upgrade(&mut stream, "echo").await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: echo"), "{head}");

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(common::STEP, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    stream.shutdown().await.unwrap();
    assert_eq!(common::read_to_close(&mut stream).await, "");
    tokio::time::timeout(common::STEP, server.close()).await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_upgrade_is_an_ordinary_response() {
    let (server, mut stream) = start().await;

    stream
        .write_all(b"GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: other\r\n\r\n")
        .await
        .unwrap();
    let response = common::read_until(&mut stream, "denied").await;
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert_eq!(common::body_of(&response), "denied");

    drop(stream);
    tokio::time::timeout(common::STEP, server.close()).await.unwrap().unwrap();
}

#[tokio::test]
async fn connect_target_is_a_hostname() {
    let (server, mut stream) = start().await;

    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let response = common::read_until(&mut stream, "CONNECT").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert_eq!(common::body_of(&response), format!("{:?} example.com:443 CONNECT", PathFormat::Hostname));

    drop(stream);
    tokio::time::timeout(common::STEP, server.close()).await.unwrap().unwrap();
}

#[tokio::test]
async fn close_waits_for_open_tunnel() {
    let (server, mut stream) = start().await;
    upgrade(&mut stream, "echo").await;

    let closing = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.close().await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!closing.is_finished());

    // The tunnel still works while the server drains.
    stream.write_all(b"pong").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    stream.shutdown().await.unwrap();
    common::read_to_close(&mut stream).await;
    tokio::time::timeout(common::STEP, closing).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn destroy_drops_open_tunnel() {
    let (server, mut stream) = start().await;
    upgrade(&mut stream, "echo").await;

    server.destroy().unwrap();
    assert_eq!(common::read_to_close(&mut stream).await, "");
}

#[tokio::test]
async fn reading_before_respond_fails_fast_and_keeps_head_bytes() {
    let (server, mut stream) = start().await;

    stream
        .write_all(b"GET /chat HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: peek\r\n\r\nHEADBYTES")
        .await
        .unwrap();
    // Bytes sent along with the request head come back first once the tunnel opens.
    let response = common::read_until(&mut stream, "HEADBYTES").await;
    assert!(response.starts_with("HTTP/1.1 101"), "{response}");
    assert!(response.to_ascii_lowercase().contains("x-early-read: refused"), "{response}");
    assert_eq!(common::body_of(&response), "HEADBYTES");

    stream.shutdown().await.unwrap();
    common::read_to_close(&mut stream).await;
    tokio::time::timeout(common::STEP, server.close()).await.unwrap().unwrap();
}
