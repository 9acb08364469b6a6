//! Request and response bodies.
//!
//! # Responsibilities
//! - Expose request bodies (HTTP/1.1, HTTP/2 or tunnel bytes) as one stream type
//! - Accept response bodies as nothing, a buffer, or a byte stream
//! - Convert response bodies into the body type hyper serves
//!
//! # Design Decisions
//! - Transport failures surface as `io::Error` items on the stream
//! - Trailers are ignored; only data frames are yielded
//! - Tunnel bytes flow only once the handler has responded; reading a tunnel
//!   body before that fails at once with `NotConnected`

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use thiserror::Error;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf, ReadHalf};

/// Body type served by the protocol adapters.
pub type HyperBody = UnsyncBoxBody<Bytes, io::Error>;

const TUNNEL_READ_CHUNK: usize = 16 * 1024;

/// Error reading a whole body into memory.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("body read failed: {0}")]
    Io(#[from] io::Error),
}

enum Source {
    Empty,
    Incoming(Incoming),
    Tunnel {
        reader: ReadHalf<DuplexStream>,
        /// Set by the responder; bytes flow only after this.
        responded: Arc<AtomicBool>,
    },
}

/// Readable side of a request: the HTTP body, or the raw tunnel bytes for
/// upgrade and CONNECT requests.
pub struct BodyStream {
    source: Source,
}

impl BodyStream {
    pub fn empty() -> Self {
        Self { source: Source::Empty }
    }

    pub(crate) fn incoming(body: Incoming) -> Self {
        Self {
            source: Source::Incoming(body),
        }
    }

    pub(crate) fn tunnel(reader: ReadHalf<DuplexStream>, responded: Arc<AtomicBool>) -> Self {
        Self {
            source: Source::Tunnel { reader, responded },
        }
    }

    /// Whether this body carries raw tunnel bytes.
    pub fn is_tunnel(&self) -> bool {
        matches!(self.source, Source::Tunnel { .. })
    }

    /// Read the whole body, failing once more than `limit` bytes arrive.
    pub async fn read_to_bytes(mut self, limit: usize) -> Result<Bytes, BodyError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(BodyError::TooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl Stream for BodyStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().source {
            Source::Empty => Poll::Ready(None),
            Source::Incoming(body) => loop {
                match ready!(Pin::new(&mut *body).poll_frame(cx)) {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            return Poll::Ready(Some(Ok(data)));
                        }
                    }
                    Some(Err(e)) => return Poll::Ready(Some(Err(io::Error::other(e)))),
                    None => return Poll::Ready(None),
                }
            },
            Source::Tunnel { reader, responded } => {
                if !responded.load(Ordering::Acquire) {
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "tunnel is not open until the request is responded to",
                    ))));
                }
                let mut chunk = [0u8; TUNNEL_READ_CHUNK];
                let mut read_buf = ReadBuf::new(&mut chunk);
                ready!(Pin::new(reader).poll_read(cx, &mut read_buf))?;
                let filled = read_buf.filled();
                if filled.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Bytes::copy_from_slice(filled))))
                }
            }
        }
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.source {
            Source::Empty => "empty",
            Source::Incoming(_) => "incoming",
            Source::Tunnel { .. } => "tunnel",
        };
        f.debug_struct("BodyStream").field("source", &kind).finish()
    }
}

/// Body handed to `respond`.
pub enum ResponseBody {
    /// No body; HTTP/2 ends the stream without data frames.
    Empty,
    /// A buffered body.
    Full(Bytes),
    /// A streamed body.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl ResponseBody {
    /// Wrap any byte stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        ResponseBody::Stream(stream.boxed())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Full(bytes) => bytes.is_empty(),
            ResponseBody::Stream(_) => false,
        }
    }

    /// Convert into the body type hyper serves.
    pub(crate) fn into_hyper(self) -> HyperBody {
        match self {
            ResponseBody::Empty => Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync(),
            ResponseBody::Full(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed_unsync(),
            ResponseBody::Stream(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
        }
    }

    /// Drain into a stream of chunks, whatever the variant.
    pub(crate) fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            ResponseBody::Empty => futures_util::stream::empty().boxed(),
            ResponseBody::Full(bytes) => futures_util::stream::once(async move { Ok(bytes) }).boxed(),
            ResponseBody::Stream(stream) => stream,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<()> for ResponseBody {
    fn from(_: ()) -> Self {
        ResponseBody::Empty
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Full(bytes)
    }
}

impl From<&'static str> for ResponseBody {
    fn from(text: &'static str) -> Self {
        ResponseBody::Full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        ResponseBody::Full(Bytes::from(text))
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(data: Vec<u8>) -> Self {
        ResponseBody::Full(Bytes::from(data))
    }
}

impl From<BodyStream> for ResponseBody {
    fn from(body: BodyStream) -> Self {
        ResponseBody::stream(body)
    }
}

impl<T: Into<ResponseBody>> From<Option<T>> for ResponseBody {
    fn from(body: Option<T>) -> Self {
        body.map_or(ResponseBody::Empty, Into::into)
    }
}
