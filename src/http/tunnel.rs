//! Upgrade and CONNECT tunnels.
//!
//! # Responsibilities
//! - Expose the raw bytes of an upgraded or CONNECT stream as the request body
//! - Send the handler's response body back through the tunnel
//! - Decide whether a response accepts or rejects the tunnel
//! - Keep every tunnel tracked until both directions finish
//!
//! # Design Decisions
//! - The handler talks to an in-memory duplex pipe; a pump task copies it to
//!   the upgraded connection once hyper has sent the response head
//! - An HTTP/1.1 `Upgrade` is accepted only by `101`; a CONNECT (HTTP/1.1 or
//!   HTTP/2) only by a `2xx`. Anything else goes out as an ordinary response
//!   and the request body ends with EOF
//! - Hyper hands over the upgraded connection only after the response head
//!   is written, so the request body is readable only after `respond`;
//!   earlier reads fail with `NotConnected` instead of waiting

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use http::header::{self, HeaderValue};
use http::{Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::oneshot;

use crate::http::body::{BodyStream, HyperBody, ResponseBody};
use crate::http::response::{build_response, RespondError, ResponseHead};
use crate::net::connection::ConnectionTracker;
use crate::observability::metrics;
use crate::observability::reporter::{ErrorSource, SharedReporter};

/// Buffer size of the in-memory pipe between handler and pump.
const TUNNEL_BUFFER: usize = 64 * 1024;

/// How the client asked for the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelKind {
    /// HTTP/1.1 `Upgrade` header.
    Upgrade,
    /// CONNECT, plain or extended.
    Connect,
}

/// What a tunnel needs from the adapter that opened it.
#[derive(Clone)]
pub(crate) struct TunnelContext {
    pub listener_id: Arc<str>,
    pub http2: bool,
    pub tunnels: ConnectionTracker,
    pub reporter: SharedReporter,
}

/// Response side of a tunnel, held by the request's responder.
pub(crate) struct TunnelSink {
    response_tx: oneshot::Sender<Response<HyperBody>>,
    writer: WriteHalf<DuplexStream>,
    responded: Arc<AtomicBool>,
    kind: TunnelKind,
    protocol: Option<String>,
    ctx: TunnelContext,
}

/// Start tracking a tunnel.
///
/// Returns the request body (tunnel bytes from the client) and the sink the
/// response must go through. The adapter's service awaits the receiving end
/// of `response_tx`.
pub(crate) fn open(
    on_upgrade: OnUpgrade,
    kind: TunnelKind,
    protocol: Option<String>,
    ctx: TunnelContext,
    response_tx: oneshot::Sender<Response<HyperBody>>,
) -> (BodyStream, TunnelSink) {
    let (mut pump_end, handler_end) = tokio::io::duplex(TUNNEL_BUFFER);
    let (reader, writer) = tokio::io::split(handler_end);

    let mut guard = ctx.tunnels.track();
    let pump_ctx = ctx.clone();
    tokio::spawn(async move {
        let upgraded = match guard.unless_forced(on_upgrade).await {
            Some(Ok(upgraded)) => upgraded,
            Some(Err(e)) => {
                tracing::debug!(listener = %pump_ctx.listener_id, error = %e, "Tunnel not opened");
                return;
            }
            None => return,
        };
        metrics::record_tunnel_opened(&pump_ctx.listener_id);

        let mut upgraded = TokioIo::new(upgraded);
        match guard
            .unless_forced(tokio::io::copy_bidirectional(&mut upgraded, &mut pump_end))
            .await
        {
            Some(Ok((from_client, to_client))) => {
                tracing::debug!(
                    listener = %pump_ctx.listener_id,
                    from_client,
                    to_client,
                    "Tunnel closed"
                );
            }
            Some(Err(e)) => {
                pump_ctx
                    .reporter
                    .report(ErrorSource::Tunnel, &pump_ctx.listener_id, &e);
            }
            None => tracing::debug!(listener = %pump_ctx.listener_id, "Tunnel dropped on forced shutdown"),
        }
    });

    let responded = Arc::new(AtomicBool::new(false));
    let sink = TunnelSink {
        response_tx,
        writer,
        responded: Arc::clone(&responded),
        kind,
        protocol,
        ctx,
    };
    (BodyStream::tunnel(reader, responded), sink)
}

impl TunnelSink {
    /// Whether `status` opens the tunnel.
    pub(crate) fn accepts(&self, status: StatusCode) -> bool {
        accepts(self.kind, self.ctx.http2, status)
    }

    pub(crate) fn respond(self, body: ResponseBody, mut head: ResponseHead) -> Result<(), RespondError> {
        self.responded.store(true, Ordering::Release);
        if !self.accepts(head.status) {
            let response = build_response(head, body.into_hyper(), self.ctx.http2);
            return self
                .response_tx
                .send(response)
                .map_err(|_| RespondError::ConnectionClosed);
        }

        if self.kind == TunnelKind::Upgrade {
            fill_upgrade_headers(&mut head, self.protocol.as_deref());
        }
        let response = build_response(head, ResponseBody::Empty.into_hyper(), self.ctx.http2);
        self.response_tx
            .send(response)
            .map_err(|_| RespondError::ConnectionClosed)?;

        let mut guard = self.ctx.tunnels.track();
        let ctx = self.ctx;
        let writer = self.writer;
        tokio::spawn(async move {
            if let Some(Err(e)) = guard.unless_forced(pipe(body.into_stream(), writer)).await {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    ctx.reporter.report(ErrorSource::Tunnel, &ctx.listener_id, &e);
                }
            }
        });
        Ok(())
    }
}

fn accepts(kind: TunnelKind, http2: bool, status: StatusCode) -> bool {
    match kind {
        TunnelKind::Upgrade if !http2 => status == StatusCode::SWITCHING_PROTOCOLS,
        _ => status.is_success(),
    }
}

/// A `101` must name the protocol it switches to.
fn fill_upgrade_headers(head: &mut ResponseHead, protocol: Option<&str>) {
    if !head.headers.contains_key(header::UPGRADE) {
        if let Some(value) = protocol.and_then(|p| HeaderValue::from_str(p).ok()) {
            head.headers.insert(header::UPGRADE, value);
        }
    }
    if !head.headers.contains_key(header::CONNECTION) {
        head.headers
            .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

async fn pipe(
    mut body: BoxStream<'static, io::Result<Bytes>>,
    mut writer: WriteHalf<DuplexStream>,
) -> io::Result<()> {
    while let Some(chunk) = body.next().await {
        writer.write_all(&chunk?).await?;
    }
    writer.shutdown().await
}
