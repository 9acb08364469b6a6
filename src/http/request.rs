//! The normalized request handed to request handlers.
//!
//! # Responsibilities
//! - Present HTTP/1.1, upgraded HTTP/1.1 and HTTP/2 requests through one type
//! - Carry request metadata (method, scheme, authority, protocol) apart from
//!   the genuine header fields
//! - Classify the request target and expose path, query and format
//! - Offer `respond`, `path_match` and `sub_request` to handlers
//!
//! # Design Decisions
//! - Head, body and responder are shared by `Arc`, so a sub-request differs
//!   from its parent only in `path`
//! - The body can be taken once; sub-requests see the same slot

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::http::body::{BodyError, BodyStream, ResponseBody};
use crate::http::path::{self, PathFormat, SearchParams};
use crate::http::response::{RespondError, Responder, ResponseInit};
use crate::lifecycle::shutdown::ShutdownHandle;
use crate::net::address::{IpFamily, SocketInfo};

/// Protocol the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http1,
    /// HTTP/1.1 `Upgrade` or CONNECT; the body is the raw tunnel.
    Http1Tunnel,
    Http2,
    /// HTTP/2 CONNECT or extended CONNECT; the body is the raw tunnel.
    Http2Tunnel,
}

impl Transport {
    pub fn is_http2(&self) -> bool {
        matches!(self, Transport::Http2 | Transport::Http2Tunnel)
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self, Transport::Http1Tunnel | Transport::Http2Tunnel)
    }
}

/// Request metadata plus the genuine header fields.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// `CONNECT` for every upgrade and CONNECT request.
    pub method: Method,
    /// `http` or `https`.
    pub scheme: &'static str,
    /// From `:authority` or the `Host` header.
    pub authority: Option<String>,
    /// From `:protocol` or the HTTP/1.1 `Upgrade` header.
    pub protocol: Option<String>,
    /// Header fields without `Host`, `Connection`, `Upgrade` and
    /// `Transfer-Encoding`.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Look up a pseudo-header by name (`:method`, `:scheme`, `:authority`,
    /// `:protocol`).
    pub fn pseudo(&self, name: &str) -> Option<&str> {
        match name {
            ":method" => Some(self.method.as_str()),
            ":scheme" => Some(self.scheme),
            ":authority" => self.authority.as_deref(),
            ":protocol" => self.protocol.as_deref(),
            _ => None,
        }
    }

    /// First value of a header field as text, or a pseudo-header if `name`
    /// starts with `:`.
    pub fn get(&self, name: &str) -> Option<&str> {
        if name.starts_with(':') {
            return self.pseudo(name);
        }
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Everything an adapter supplies to build a request.
pub(crate) struct RequestParts {
    pub listener_id: Arc<str>,
    pub socket: SocketInfo,
    pub secure: bool,
    pub transport: Transport,
    pub head: RequestHead,
    /// Request target, or the authority for a plain CONNECT.
    pub raw_target: String,
    pub body: BodyStream,
    pub responder: Responder,
    pub server: ShutdownHandle,
}

/// A request, independent of the protocol it arrived on.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    listener_id: Arc<str>,
    socket: SocketInfo,
    secure: bool,
    transport: Transport,
    head: Arc<RequestHead>,
    path_format: PathFormat,
    path: Option<String>,
    search_params: Arc<SearchParams>,
    path_raw: Arc<str>,
    body: Arc<Mutex<Option<BodyStream>>>,
    responder: Arc<Responder>,
    server: ShutdownHandle,
}

impl NormalizedRequest {
    pub(crate) fn new(parts: RequestParts) -> Self {
        let parsed = path::classify(&parts.raw_target);
        Self {
            listener_id: parts.listener_id,
            socket: parts.socket,
            secure: parts.secure,
            transport: parts.transport,
            head: Arc::new(parts.head),
            path_format: parsed.format,
            path: parsed.path,
            search_params: Arc::new(parsed.search_params),
            path_raw: Arc::from(parts.raw_target),
            body: Arc::new(Mutex::new(Some(parts.body))),
            responder: Arc::new(parts.responder),
            server: parts.server,
        }
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn ip_family(&self) -> IpFamily {
        self.socket.family
    }

    pub fn local_address(&self) -> IpAddr {
        self.socket.local_address
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_port
    }

    pub fn remote_address(&self) -> IpAddr {
        self.socket.remote_address
    }

    pub fn remote_port(&self) -> u16 {
        self.socket.remote_port
    }

    pub fn socket(&self) -> &SocketInfo {
        &self.socket
    }

    /// Whether the request arrived over TLS.
    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn path_format(&self) -> PathFormat {
        self.path_format
    }

    /// Decoded path without the leading `/`, the verbatim target for
    /// `Hostname`/`AbsolutePath`, or `None` when the target was invalid.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn search_params(&self) -> &SearchParams {
        &self.search_params
    }

    /// The target exactly as received.
    pub fn path_raw(&self) -> &str {
        &self.path_raw
    }

    /// Shutdown registry of the server that accepted this request.
    pub fn server(&self) -> &ShutdownHandle {
        &self.server
    }

    /// Take the body stream. Returns `None` once taken, by this request or
    /// any request sharing its body.
    pub fn take_body(&self) -> Option<BodyStream> {
        self.body.lock().expect("request body mutex poisoned").take()
    }

    /// Read the whole body into memory, up to `limit` bytes.
    pub async fn body_bytes(&self, limit: usize) -> Result<Bytes, BodyError> {
        match self.take_body() {
            Some(body) => body.read_to_bytes(limit).await,
            None => Ok(Bytes::new()),
        }
    }

    /// Whether both requests share one body slot.
    pub fn shares_body_with(&self, other: &NormalizedRequest) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    /// Whether both requests share one head.
    pub fn shares_head_with(&self, other: &NormalizedRequest) -> bool {
        Arc::ptr_eq(&self.head, &other.head)
    }

    /// Mount-point match.
    ///
    /// `""` matches everything; a prefix ending in `/` matches any path
    /// starting with it; any other prefix must equal the path.
    pub fn path_match(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        match &self.path {
            Some(path) if prefix.ends_with('/') => path.starts_with(prefix),
            Some(path) => path == prefix,
            None => false,
        }
    }

    /// A request identical to this one except that `prefix.len()` bytes are
    /// cut from the front of `path`.
    pub fn sub_request(&self, prefix: &str) -> NormalizedRequest {
        let path = self
            .path
            .as_deref()
            .map(|p| p.get(prefix.len()..).unwrap_or_default().to_string());
        NormalizedRequest {
            path,
            ..self.clone()
        }
    }

    /// Send the response.
    ///
    /// `init` is `()` for `200 text/plain`, a `StatusCode` for that status
    /// with the same content type, or a `ResponseHead` used verbatim.
    pub fn respond(
        &self,
        body: impl Into<ResponseBody>,
        init: impl Into<ResponseInit>,
    ) -> Result<(), RespondError> {
        self.responder.respond(body.into(), init.into().into_head())
    }

    /// Whether this request (or one sharing its responder) was answered.
    pub fn has_responded(&self) -> bool {
        self.responder.has_responded()
    }
}
