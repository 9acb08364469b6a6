//! Protocol adapters.
//!
//! # Responsibilities
//! - Serve HTTP/1.1 and HTTP/2 connections handed over by a listener or a
//!   TLS frontend
//! - Turn every request (plain, upgrade, CONNECT or HTTP/2 stream) into a
//!   `NormalizedRequest` and run the request handler on it
//! - Track connections and tunnels so shutdown can drain or force them
//!
//! # Design Decisions
//! - The handler runs in its own task; the hyper service only waits for the
//!   response, so a handler that never answers yields a 500
//! - HTTP/1.1 upgrades and CONNECT share one representation: method CONNECT,
//!   `:protocol` from the `Upgrade` header

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::header::{self, HeaderMap};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::config::schema::{Http1Options, Http2Options, ListenerMode};
use crate::http::body::{BodyStream, HyperBody, ResponseBody};
use crate::http::request::{NormalizedRequest, RequestHead, RequestParts, Transport};
use crate::http::response::{
    build_response, strip_connection_headers, Responder, ResponseInit, ResponseSink,
};
use crate::http::tunnel::{self, TunnelContext, TunnelKind};
use crate::lifecycle::shutdown::ShutdownHandle;
use crate::net::address::SocketInfo;
use crate::net::connection::{drive_connection, ConnectionGuard, ConnectionTracker};
use crate::observability::metrics;
use crate::observability::reporter::{ErrorSource, SharedReporter};

/// Request handler supplied to the server.
pub trait RequestListener: Send + Sync + 'static {
    fn call(&self, req: NormalizedRequest) -> BoxFuture<'static, ()>;
}

impl<F, Fut> RequestListener for F
where
    F: Fn(NormalizedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, req: NormalizedRequest) -> BoxFuture<'static, ()> {
        Box::pin(self(req))
    }
}

/// Shared request handler.
pub type SharedListener = Arc<dyn RequestListener>;

#[derive(Debug, Error)]
#[error("request handler finished without responding")]
struct Unanswered;

/// Per-listener protocol handling.
pub struct ProtocolAdapter {
    listener_id: Arc<str>,
    mode: ListenerMode,
    secure: bool,
    handler: SharedListener,
    server: ShutdownHandle,
    connections: ConnectionTracker,
    tunnels: ConnectionTracker,
    http1: Http1Options,
    http2: Http2Options,
    reporter: SharedReporter,
}

/// Settings an adapter is built from.
pub struct AdapterConfig {
    pub listener_id: String,
    pub mode: ListenerMode,
    pub http1: Http1Options,
    pub http2: Http2Options,
}

impl ProtocolAdapter {
    pub fn new(
        config: AdapterConfig,
        handler: SharedListener,
        server: ShutdownHandle,
        reporter: SharedReporter,
    ) -> Self {
        Self {
            listener_id: Arc::from(config.listener_id),
            secure: config.mode.is_tls(),
            mode: config.mode,
            handler,
            server,
            connections: ConnectionTracker::new("connections"),
            tunnels: ConnectionTracker::new("tunnels"),
            http1: config.http1,
            http2: config.http2,
            reporter,
        }
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn mode(&self) -> ListenerMode {
        self.mode
    }

    pub fn is_http2(&self) -> bool {
        self.mode == ListenerMode::Http2
    }

    /// Live HTTP/1.1 connections and HTTP/2 sessions.
    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Live upgrade and CONNECT tunnels.
    pub fn tunnels(&self) -> &ConnectionTracker {
        &self.tunnels
    }

    /// Ask connections to finish in-flight work. Tunnels are left to end on
    /// their own.
    pub fn graceful(&self) {
        self.connections.graceful();
    }

    /// Drop every connection and tunnel.
    pub fn force(&self) {
        self.connections.force();
        self.tunnels.force();
    }

    /// Wait until every connection and tunnel has ended.
    pub async fn wait_idle(&self) {
        self.tunnels.wait_idle().await;
        self.connections.wait_idle().await;
        // A connection may have opened a tunnel while we waited.
        self.tunnels.wait_idle().await;
    }

    /// Serve one accepted (and, for TLS, already handshaken) connection.
    ///
    /// The connection is tracked as soon as this is called, before the
    /// returned future is first polled.
    pub fn serve_connection<I>(
        self: Arc<Self>,
        io: I,
        socket: SocketInfo,
    ) -> impl Future<Output = ()> + Send + 'static
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = self.connections.track();
        self.serve_tracked(io, socket, guard)
    }

    async fn serve_tracked<I>(self: Arc<Self>, io: I, socket: SocketInfo, mut guard: ConnectionGuard)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tracing::debug!(
            listener = %self.listener_id,
            connection_id = %guard.id(),
            remote = %socket.remote(),
            mode = %self.mode,
            "Serving connection"
        );

        let http2 = self.is_http2();
        let adapter = Arc::clone(&self);
        let service = service_fn(move |req| {
            let adapter = Arc::clone(&adapter);
            async move { Ok::<_, Infallible>(adapter.dispatch(req, socket, http2).await) }
        });

        let result = if http2 {
            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder.max_concurrent_streams(self.http2.max_concurrent_streams);
            if self.http2.enable_connect_protocol {
                builder.enable_connect_protocol();
            }
            if let Some(size) = self.http2.initial_window_size {
                builder.initial_stream_window_size(size);
            }
            drive_connection!(builder.serve_connection(TokioIo::new(io), service), &mut guard)
        } else {
            let mut builder = http1::Builder::new();
            builder
                .keep_alive(self.http1.keep_alive)
                .half_close(self.http1.half_close);
            drive_connection!(
                builder.serve_connection(TokioIo::new(io), service).with_upgrades(),
                &mut guard
            )
        };

        if let Err(e) = result {
            if e.is_incomplete_message() || e.is_canceled() {
                tracing::debug!(listener = %self.listener_id, error = %e, "Connection ended early");
            } else {
                self.reporter
                    .report(ErrorSource::Connection, &self.listener_id, &e);
            }
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        socket: SocketInfo,
        http2: bool,
    ) -> Response<HyperBody> {
        let tunnel = tunnel_kind(&req, http2);
        let on_upgrade = tunnel.map(|_| hyper::upgrade::on(&mut req));
        let (parts, body) = req.into_parts();
        let (response_tx, response_rx) = oneshot::channel();

        let normalized = if http2 {
            normalize_http2(&parts, self.secure)
        } else {
            normalize_http1(&parts, self.secure, tunnel)
        };
        let (head, raw_target) = normalized;

        let (body, responder, transport) = match (tunnel, on_upgrade) {
            (Some(kind), Some(on_upgrade)) => {
                let ctx = TunnelContext {
                    listener_id: Arc::clone(&self.listener_id),
                    http2,
                    tunnels: self.tunnels.clone(),
                    reporter: Arc::clone(&self.reporter),
                };
                let (body, sink) =
                    tunnel::open(on_upgrade, kind, head.protocol.clone(), ctx, response_tx);
                let transport = if http2 { Transport::Http2Tunnel } else { Transport::Http1Tunnel };
                (body, Responder::new(ResponseSink::Tunnel(sink), http2), transport)
            }
            _ => {
                let transport = if http2 { Transport::Http2 } else { Transport::Http1 };
                (
                    BodyStream::incoming(body),
                    Responder::new(ResponseSink::Http(response_tx), http2),
                    transport,
                )
            }
        };

        metrics::record_request(&self.listener_id, if http2 { "h2" } else { "http/1.1" });
        let request = NormalizedRequest::new(RequestParts {
            listener_id: Arc::clone(&self.listener_id),
            socket,
            secure: self.secure,
            transport,
            head,
            raw_target,
            body,
            responder,
            server: self.server.clone(),
        });
        tokio::spawn(self.handler.call(request));

        match response_rx.await {
            Ok(response) => response,
            Err(_) => {
                self.reporter
                    .report(ErrorSource::Handler, &self.listener_id, &Unanswered);
                build_response(
                    ResponseInit::Status(StatusCode::INTERNAL_SERVER_ERROR).into_head(),
                    ResponseBody::Empty.into_hyper(),
                    http2,
                )
            }
        }
    }
}

/// Whether a request asks for a tunnel, and how.
fn tunnel_kind<B>(req: &Request<B>, http2: bool) -> Option<TunnelKind> {
    if req.method() == Method::CONNECT {
        return Some(TunnelKind::Connect);
    }
    if !http2 && req.headers().contains_key(header::UPGRADE) && connection_has_upgrade(req.headers()) {
        return Some(TunnelKind::Upgrade);
    }
    None
}

fn connection_has_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn header_text(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn scheme(secure: bool) -> &'static str {
    if secure {
        "https"
    } else {
        "http"
    }
}

/// Head and request target of an HTTP/1.1 request.
fn normalize_http1(parts: &Parts, secure: bool, tunnel: Option<TunnelKind>) -> (RequestHead, String) {
    let mut headers = parts.headers.clone();
    let authority = header_text(&headers, header::HOST);
    let protocol = match tunnel {
        Some(TunnelKind::Upgrade) => header_text(&headers, header::UPGRADE),
        _ => None,
    };
    headers.remove(header::HOST);
    strip_connection_headers(&mut headers);

    let method = match tunnel {
        Some(_) => Method::CONNECT,
        None => parts.method.clone(),
    };
    let head = RequestHead {
        method,
        scheme: scheme(secure),
        authority,
        protocol,
        headers,
    };
    (head, parts.uri.to_string())
}

/// Head and request target of an HTTP/2 stream.
fn normalize_http2(parts: &Parts, secure: bool) -> (RequestHead, String) {
    let mut headers = parts.headers.clone();
    let authority = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| header_text(&headers, header::HOST));
    let protocol = parts
        .extensions
        .get::<hyper::ext::Protocol>()
        .map(|p| p.as_str().to_string());
    headers.remove(header::HOST);
    strip_connection_headers(&mut headers);

    let raw_target = if parts.method == Method::CONNECT && protocol.is_none() {
        authority.clone().unwrap_or_default()
    } else {
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    };

    let head = RequestHead {
        method: parts.method.clone(),
        scheme: parts
            .uri
            .scheme_str()
            .map(|s| if s == "https" { "https" } else { "http" })
            .unwrap_or(scheme(secure)),
        authority,
        protocol,
        headers,
    };
    (head, raw_target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn http1_plain_request() {
        let req = Request::builder()
            .method("POST")
            .uri("/submit?x=1")
            .header("host", "example.com:8080")
            .header("transfer-encoding", "chunked")
            .header("x-custom", "yes")
            .body(())
            .unwrap();
        assert_eq!(tunnel_kind(&req, false), None);

        let (head, target) = normalize_http1(&parts(req), true, None);
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.pseudo(":scheme"), Some("https"));
        assert_eq!(head.pseudo(":authority"), Some("example.com:8080"));
        assert!(head.headers.get("host").is_none());
        assert!(head.headers.get("transfer-encoding").is_none());
        assert_eq!(head.headers["x-custom"], "yes");
        assert_eq!(target, "/submit?x=1");
    }

    #[test]
    fn http1_upgrade_becomes_connect() {
        let req = Request::builder()
            .uri("/chat")
            .header("host", "example.com")
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        let kind = tunnel_kind(&req, false);
        assert_eq!(kind, Some(TunnelKind::Upgrade));

        let (head, target) = normalize_http1(&parts(req), false, kind);
        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(head.pseudo(":protocol"), Some("websocket"));
        assert!(head.headers.get("upgrade").is_none());
        assert!(head.headers.get("connection").is_none());
        assert_eq!(target, "/chat");
    }

    #[test]
    fn upgrade_header_without_connection_token_is_plain() {
        let req = Request::builder()
            .uri("/")
            .header("upgrade", "websocket")
            .header("connection", "keep-alive")
            .body(())
            .unwrap();
        assert_eq!(tunnel_kind(&req, false), None);
    }

    #[test]
    fn http1_connect_targets_authority() {
        let req = Request::builder()
            .method("CONNECT")
            .uri("example.com:443")
            .header("host", "example.com:443")
            .body(())
            .unwrap();
        let kind = tunnel_kind(&req, false);
        assert_eq!(kind, Some(TunnelKind::Connect));

        let (head, target) = normalize_http1(&parts(req), false, kind);
        assert_eq!(head.protocol, None);
        assert_eq!(target, "example.com:443");
    }

    #[test]
    fn http2_request_uses_pseudo_headers() {
        let req = Request::builder()
            .uri("https://example.com/index.html?q=1")
            .header("accept", "*/*")
            .body(())
            .unwrap();
        assert_eq!(tunnel_kind(&req, true), None);

        let (head, target) = normalize_http2(&parts(req), true);
        assert_eq!(head.pseudo(":authority"), Some("example.com"));
        assert_eq!(head.pseudo(":scheme"), Some("https"));
        assert_eq!(head.pseudo(":method"), Some("GET"));
        assert_eq!(target, "/index.html?q=1");
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn http2_connect_targets_authority() {
        let req = Request::builder()
            .method("CONNECT")
            .uri("example.com:443")
            .body(())
            .unwrap();
        assert_eq!(tunnel_kind(&req, true), Some(TunnelKind::Connect));

        let (head, target) = normalize_http2(&parts(req), true);
        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(target, "example.com:443");
    }

    #[test]
    fn http2_never_uses_upgrade_header() {
        let req = Request::builder()
            .uri("/")
            .header("upgrade", "websocket")
            .header("connection", "upgrade")
            .body(())
            .unwrap();
        assert_eq!(tunnel_kind(&req, true), None);
    }
}
