//! TLS frontends and ALPN demultiplexing.
//!
//! # Responsibilities
//! - Own the TLS acceptor of one physical TLS socket
//! - Track every connection from accept through handshake to close
//! - Route each handshaken connection to the HTTP/1.1 or HTTP/2 adapter by
//!   the negotiated ALPN protocol
//!
//! # Design Decisions
//! - A standalone TLS listener is a frontend with a single route, so shared
//!   and unshared sockets go through the same handshake path
//! - Routing is keyed by the `[address]:port` group built once at startup;
//!   adapters never reference each other
//! - The connection is handed over already secured; no second handshake

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::http::adapter::ProtocolAdapter;
use crate::net::address::SocketInfo;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::session_cache::SessionCache;
use crate::net::tls::ALPN_H2;
use crate::observability::metrics;
use crate::observability::reporter::{ErrorSource, SharedReporter};

/// Protocol a handshaken connection is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    Http1,
    Http2,
}

impl AlpnProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlpnProtocol::Http1 => "http/1.1",
            AlpnProtocol::Http2 => "h2",
        }
    }
}

/// `h2` goes to HTTP/2; `http/1.1` or no negotiation goes to HTTP/1.1.
pub fn select_protocol(negotiated: Option<&[u8]>) -> AlpnProtocol {
    match negotiated {
        Some(proto) if proto == ALPN_H2 => AlpnProtocol::Http2,
        _ => AlpnProtocol::Http1,
    }
}

/// Where handshaken connections go.
pub enum AlpnRoutes {
    /// Single listener on this socket.
    Direct(Arc<ProtocolAdapter>),
    /// Two listeners sharing this socket.
    Demux {
        http1: Arc<ProtocolAdapter>,
        http2: Arc<ProtocolAdapter>,
    },
}

impl AlpnRoutes {
    pub fn route(&self, protocol: AlpnProtocol) -> &Arc<ProtocolAdapter> {
        match self {
            AlpnRoutes::Direct(adapter) => adapter,
            AlpnRoutes::Demux { http1, .. } if protocol == AlpnProtocol::Http1 => http1,
            AlpnRoutes::Demux { http2, .. } => http2,
        }
    }
}

/// One physical TLS socket.
pub struct TlsFrontend {
    /// Group key (`[address]:port`) or listener ID, for logs.
    name: String,
    acceptor: TlsAcceptor,
    routes: AlpnRoutes,
    connections: ConnectionTracker,
    session_cache: Option<Arc<SessionCache>>,
    reporter: SharedReporter,
}

impl TlsFrontend {
    pub fn new(
        name: String,
        config: Arc<rustls::ServerConfig>,
        routes: AlpnRoutes,
        session_cache: Option<Arc<SessionCache>>,
        reporter: SharedReporter,
    ) -> Self {
        Self {
            name,
            acceptor: TlsAcceptor::from(config),
            routes,
            connections: ConnectionTracker::new("tls"),
            session_cache,
            reporter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether two listeners share this socket.
    pub fn is_shared(&self) -> bool {
        matches!(self.routes, AlpnRoutes::Demux { .. })
    }

    pub fn routes(&self) -> &AlpnRoutes {
        &self.routes
    }

    pub fn session_cache(&self) -> Option<&Arc<SessionCache>> {
        self.session_cache.as_ref()
    }

    /// Every connection accepted on this socket that has not closed yet.
    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Stop the session cache sweep.
    pub fn cancel_sweep(&self) {
        if let Some(cache) = &self.session_cache {
            cache.cancel_sweep();
        }
    }

    /// Track an accepted socket, then handshake and dispatch it.
    pub fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        socket: SocketInfo,
    ) -> impl Future<Output = ()> + Send + 'static {
        let guard = self.connections.track();
        self.handshake_and_dispatch(stream, socket, guard)
    }

    async fn handshake_and_dispatch(
        self: Arc<Self>,
        stream: TcpStream,
        socket: SocketInfo,
        mut guard: ConnectionGuard,
    ) {
        let tls = match guard.unless_forced(self.acceptor.accept(stream)).await {
            Some(Ok(tls)) => tls,
            Some(Err(e)) => {
                metrics::record_handshake_failure(&self.name);
                self.reporter.report(ErrorSource::Handshake, &self.name, &e);
                return;
            }
            None => return,
        };

        let (tcp, session) = tls.get_ref();
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(frontend = %self.name, error = %e, "Failed to set TCP_NODELAY");
        }
        let protocol = select_protocol(session.alpn_protocol());
        let adapter = Arc::clone(self.routes.route(protocol));

        metrics::record_alpn_dispatch(protocol.as_str());
        tracing::debug!(
            frontend = %self.name,
            connection_id = %guard.id(),
            alpn = protocol.as_str(),
            listener = adapter.listener_id(),
            "TLS connection dispatched"
        );

        adapter.serve_connection(tls, socket).await;
        drop(guard);
    }
}
