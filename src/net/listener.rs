//! TCP listeners and accept loops.
//!
//! # Responsibilities
//! - Bind one TCP socket per physical listener
//! - Accept connections until told to stop
//! - Hand each connection to its protocol adapter or TLS frontend
//! - Report accept errors without ending the loop
//!
//! # Design Decisions
//! - A connection is tracked before its task is spawned, so shutdown never
//!   misses one that was just accepted
//! - Stopping the loop drops the socket; connections already accepted are
//!   left to the adapters

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::http::adapter::ProtocolAdapter;
use crate::net::address::SocketInfo;
use crate::net::demux::TlsFrontend;
use crate::observability::metrics;
use crate::observability::reporter::{ErrorSource, SharedReporter};

/// Pause after a failed accept, so a full file table does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Where accepted connections go.
#[derive(Clone)]
pub enum ConnectionTarget {
    Plain(Arc<ProtocolAdapter>),
    Tls(Arc<TlsFrontend>),
}

impl ConnectionTarget {
    fn name(&self) -> &str {
        match self {
            ConnectionTarget::Plain(adapter) => adapter.listener_id(),
            ConnectionTarget::Tls(frontend) => frontend.name(),
        }
    }
}

/// Resolve a bind address and port.
pub fn socket_addr(bind_address: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let ip: IpAddr = bind_address
        .parse()
        .map_err(|_| ListenerError::InvalidAddress(bind_address.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// A bound TCP socket and the target of its connections.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    target: ConnectionTarget,
    reporter: SharedReporter,
}

impl Listener {
    /// Bind to `addr`.
    pub async fn bind(
        addr: SocketAddr,
        target: ConnectionTarget,
        reporter: SharedReporter,
    ) -> Result<Self, ListenerError> {
        let bind_error = |source| ListenerError::Bind {
            address: addr.to_string(),
            source,
        };
        let inner = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = inner.local_addr().map_err(bind_error)?;

        tracing::info!(
            address = %local_addr,
            target = target.name(),
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            target,
            reporter,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Run the accept loop on its own task until `stop` turns true.
    pub fn spawn(self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop(stop))
    }

    async fn accept_loop(self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                // The watch guard must not outlive the branch: it is !Send.
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let local = stream.local_addr().unwrap_or(self.local_addr);
                        let socket = SocketInfo::from_addrs(local, remote);
                        metrics::record_connection_accepted(self.target.name());
                        tracing::debug!(
                            listener = self.target.name(),
                            peer_addr = %remote,
                            "Connection accepted"
                        );
                        match &self.target {
                            ConnectionTarget::Plain(adapter) => {
                                tokio::spawn(Arc::clone(adapter).serve_connection(stream, socket));
                            }
                            ConnectionTarget::Tls(frontend) => {
                                tokio::spawn(Arc::clone(frontend).serve(stream, socket));
                            }
                        }
                    }
                    Err(e) => {
                        self.reporter.report(ErrorSource::Accept, self.target.name(), &e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        tracing::info!(address = %self.local_addr, "Listener stopped");
    }
}
