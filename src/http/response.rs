//! Response initialization and delivery.
//!
//! # Responsibilities
//! - Turn the `respond(body, init)` arguments into a status and header set
//! - Deliver exactly one response per request to the protocol adapter
//! - Strip connection-level headers that HTTP/2 forbids
//!
//! # Design Decisions
//! - Responding is synchronous: the response is handed to hyper, which
//!   streams the body on the connection task
//! - A second `respond` is an error, not a silent no-op

use std::sync::Mutex;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::http::body::{HyperBody, ResponseBody};
use crate::http::tunnel::TunnelSink;

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Headers that only describe a single HTTP/1.1 connection.
const CONNECTION_HEADERS: [HeaderName; 4] = [
    header::CONNECTION,
    header::UPGRADE,
    header::TRANSFER_ENCODING,
    HeaderName::from_static("keep-alive"),
];

/// Error returned by `respond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RespondError {
    #[error("a response was already sent for this request")]
    AlreadyResponded,

    #[error("the connection closed before the response could be sent")]
    ConnectionClosed,
}

/// Status and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    fn with_default_content_type(status: StatusCode) -> Self {
        let mut head = Self::new(status);
        head.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(DEFAULT_CONTENT_TYPE),
        );
        head
    }
}

/// Second argument of `respond`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseInit {
    /// `200` with a plain-text content type.
    #[default]
    Default,
    /// The given status with a plain-text content type.
    Status(StatusCode),
    /// Used verbatim.
    Head(ResponseHead),
}

impl ResponseInit {
    pub fn into_head(self) -> ResponseHead {
        match self {
            ResponseInit::Default => ResponseHead::with_default_content_type(StatusCode::OK),
            ResponseInit::Status(status) => ResponseHead::with_default_content_type(status),
            ResponseInit::Head(head) => head,
        }
    }
}

impl From<()> for ResponseInit {
    fn from(_: ()) -> Self {
        ResponseInit::Default
    }
}

impl From<StatusCode> for ResponseInit {
    fn from(status: StatusCode) -> Self {
        ResponseInit::Status(status)
    }
}

impl From<ResponseHead> for ResponseInit {
    fn from(head: ResponseHead) -> Self {
        ResponseInit::Head(head)
    }
}

impl<T: Into<ResponseInit>> From<Option<T>> for ResponseInit {
    fn from(init: Option<T>) -> Self {
        init.map_or(ResponseInit::Default, Into::into)
    }
}

/// Build a hyper response from a head and body.
pub(crate) fn build_response(head: ResponseHead, body: HyperBody, http2: bool) -> Response<HyperBody> {
    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    if http2 {
        strip_connection_headers(response.headers_mut());
    }
    response
}

/// Remove headers that only apply to one HTTP/1.1 connection.
pub fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in CONNECTION_HEADERS.iter() {
        headers.remove(name);
    }
}

/// Where a request's single response goes.
pub(crate) enum ResponseSink {
    /// Ordinary request: the adapter's service awaits this.
    Http(oneshot::Sender<Response<HyperBody>>),
    /// Upgrade or CONNECT: accepted responses open the tunnel.
    Tunnel(TunnelSink),
}

/// One-shot response slot shared by a request and its sub-requests.
pub struct Responder {
    sink: Mutex<Option<ResponseSink>>,
    http2: bool,
}

impl Responder {
    pub(crate) fn new(sink: ResponseSink, http2: bool) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            http2,
        }
    }

    /// Whether a response was already handed off.
    pub fn has_responded(&self) -> bool {
        self.sink.lock().expect("responder mutex poisoned").is_none()
    }

    pub(crate) fn respond(&self, body: ResponseBody, head: ResponseHead) -> Result<(), RespondError> {
        let sink = self
            .sink
            .lock()
            .expect("responder mutex poisoned")
            .take()
            .ok_or(RespondError::AlreadyResponded)?;

        match sink {
            ResponseSink::Http(tx) => {
                let response = build_response(head, body.into_hyper(), self.http2);
                tx.send(response).map_err(|_| RespondError::ConnectionClosed)
            }
            ResponseSink::Tunnel(tunnel) => tunnel.respond(body, head),
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("responded", &self.has_responded())
            .field("http2", &self.http2)
            .finish()
    }
}
