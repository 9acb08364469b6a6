//! Server construction, listen, close and destroy.
//!
//! # Responsibilities
//! - Validate the listener set and build one protocol adapter per listener
//! - Group TLS listeners by `[address]:port` and build one TLS frontend per
//!   physical TLS socket
//! - Bind every physical socket on `listen()`
//! - Drain everything on `close()`, or drop everything on `destroy()`
//!
//! # Design Decisions
//! - Fail fast: any configuration or TLS material problem fails `new`
//! - The group table exists only while building; afterwards each listener
//!   knows its frontend, never its sibling
//! - The first-declared listener of a TLS group is the primary: its TLS
//!   options (and session cache settings) win
//! - `close()` has no deadline of its own; callers wrap it in a timeout

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{join_all, try_join_all};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::schema::{ListenerMode, ListenerSpec};
use crate::config::validation::validate_listeners;
use crate::config::ConfigError;
use crate::http::adapter::{AdapterConfig, ProtocolAdapter, RequestListener, SharedListener};
use crate::lifecycle::shutdown::{ShutdownHandle, ShutdownKey};
use crate::net::demux::{AlpnRoutes, TlsFrontend};
use crate::net::listener::{socket_addr, ConnectionTarget, Listener, ListenerError};
use crate::net::session_cache::SessionCache;
use crate::net::tls::{self, ALPN_H2, ALPN_HTTP11};
use crate::observability::reporter::{LogReporter, SharedReporter};

/// ALPN offer of a socket shared by an HTTP/1.1 and an HTTP/2 listener.
const GROUP_ALPN: &[&[u8]] = &[ALPN_H2, ALPN_HTTP11];
const HTTP2_ALPN: &[&[u8]] = &[ALPN_H2];
const HTTP1_ALPN: &[&[u8]] = &[ALPN_HTTP11];

/// Error type for lifecycle operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("server is already listening")]
    AlreadyListening,

    #[error("server is not listening")]
    NotListening,

    #[error("server has been closed")]
    Closed,
}

/// Where a server is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Binding,
    Listening,
    Closing,
    Closed,
}

/// One configured listener.
struct ListenerRuntime {
    listener_id: String,
    adapter: Arc<ProtocolAdapter>,
    /// TLS frontend serving this listener, shared with a sibling if grouped.
    frontend: Option<Arc<TlsFrontend>>,
}

/// One physical socket to bind.
struct SocketPlan {
    bind_address: String,
    bind_port: u16,
    target: ConnectionTarget,
    /// Indices of the listeners served through this socket.
    listeners: Vec<usize>,
}

#[derive(Default)]
struct Running {
    accept_loops: Vec<JoinHandle<()>>,
    /// Bound address per listener index.
    local_addrs: HashMap<usize, SocketAddr>,
}

/// A set of listeners sharing one request handler and one shutdown registry.
pub struct Server {
    runtimes: Vec<ListenerRuntime>,
    sockets: Vec<SocketPlan>,
    frontends: Vec<Arc<TlsFrontend>>,
    registry: ShutdownHandle,
    reporter: SharedReporter,
    state: Mutex<LifecycleState>,
    stop: watch::Sender<bool>,
    /// Turns true once the server reaches `Closed`.
    closed: watch::Sender<bool>,
    running: Mutex<Running>,
}

impl Server {
    /// Build a server that logs swallowed errors through `tracing`.
    pub fn new<L>(instances: Vec<ListenerSpec>, listener: L) -> Result<Self, ConfigError>
    where
        L: RequestListener,
    {
        Self::with_error_reporter(instances, listener, Arc::new(LogReporter))
    }

    /// Build a server with an explicit error reporting policy.
    pub fn with_error_reporter<L>(
        instances: Vec<ListenerSpec>,
        listener: L,
        reporter: SharedReporter,
    ) -> Result<Self, ConfigError>
    where
        L: RequestListener,
    {
        validate_listeners(&instances).map_err(ConfigError::Validation)?;

        let handler: SharedListener = Arc::new(listener);
        let registry = ShutdownHandle::new();

        let mut runtimes: Vec<ListenerRuntime> = instances
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let listener_id = spec
                    .listener_id
                    .clone()
                    .unwrap_or_else(|| format!("listener-{}", index));
                let adapter = ProtocolAdapter::new(
                    AdapterConfig {
                        listener_id: listener_id.clone(),
                        mode: spec.mode,
                        http1: spec.options.http1.clone(),
                        http2: spec.options.http2.clone(),
                    },
                    Arc::clone(&handler),
                    registry.clone(),
                    Arc::clone(&reporter),
                );
                ListenerRuntime {
                    listener_id,
                    adapter: Arc::new(adapter),
                    frontend: None,
                }
            })
            .collect();

        // [address]:port → TLS listener indices, in declaration order
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, spec) in instances.iter().enumerate() {
            if spec.mode.is_tls() {
                groups.entry(spec.group_key()).or_default().push(index);
            }
        }

        let mut sockets = Vec::new();
        let mut frontends = Vec::new();
        for (index, spec) in instances.iter().enumerate() {
            if !spec.mode.is_tls() {
                sockets.push(SocketPlan {
                    bind_address: spec.bind_address.clone(),
                    bind_port: spec.bind_port,
                    target: ConnectionTarget::Plain(Arc::clone(&runtimes[index].adapter)),
                    listeners: vec![index],
                });
                continue;
            }

            let key = spec.group_key();
            let members = groups.get(&key).cloned().unwrap_or_default();
            if members.first() != Some(&index) {
                // Served by the primary's frontend.
                continue;
            }

            let frontend = Arc::new(build_frontend(&key, &members, &instances, &runtimes, &reporter)?);
            for &member in &members {
                runtimes[member].frontend = Some(Arc::clone(&frontend));
            }
            sockets.push(SocketPlan {
                bind_address: spec.bind_address.clone(),
                bind_port: spec.bind_port,
                target: ConnectionTarget::Tls(Arc::clone(&frontend)),
                listeners: members,
            });
            frontends.push(frontend);
        }

        tracing::debug!(
            listeners = runtimes.len(),
            sockets = sockets.len(),
            tls_frontends = frontends.len(),
            "Server built"
        );

        let (stop, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Ok(Self {
            runtimes,
            sockets,
            frontends,
            registry,
            reporter,
            state: Mutex::new(LifecycleState::Idle),
            stop,
            closed,
            running: Mutex::new(Running::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().expect("server state mutex poisoned")
    }

    fn lock_running(&self) -> MutexGuard<'_, Running> {
        self.running.lock().expect("server running mutex poisoned")
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == LifecycleState::Listening
    }

    /// Bind every physical socket and start accepting.
    ///
    /// Fails on the first bind error; nothing stays bound in that case and
    /// `listen()` may be called again.
    pub async fn listen(&self) -> Result<(), ServerError> {
        {
            let mut state = self.lock_state();
            match *state {
                LifecycleState::Idle => *state = LifecycleState::Binding,
                LifecycleState::Closed => return Err(ServerError::Closed),
                _ => return Err(ServerError::AlreadyListening),
            }
        }

        let binds = self.sockets.iter().map(|plan| async move {
            let addr = socket_addr(&plan.bind_address, plan.bind_port)?;
            Listener::bind(addr, plan.target.clone(), Arc::clone(&self.reporter)).await
        });
        let listeners = match try_join_all(binds).await {
            Ok(listeners) => listeners,
            Err(e) => {
                *self.lock_state() = LifecycleState::Idle;
                return Err(e.into());
            }
        };

        {
            let mut running = self.lock_running();
            for (plan, listener) in self.sockets.iter().zip(listeners) {
                for &index in &plan.listeners {
                    running.local_addrs.insert(index, listener.local_addr());
                }
                running.accept_loops.push(listener.spawn(self.stop.subscribe()));
            }
        }

        let mut state = self.lock_state();
        if *state == LifecycleState::Binding {
            *state = LifecycleState::Listening;
        }
        tracing::info!(
            listeners = self.runtimes.len(),
            sockets = self.sockets.len(),
            "Server listening"
        );
        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// Runs the registered shutdown functions, stops accepting, waits for
    /// connections, sessions and tunnels to end on their own, closes TLS
    /// frontends once drained, then awaits the registered shutdown futures.
    ///
    /// A call made while another `close()` is draining resolves when that
    /// one finishes.
    pub async fn close(&self) -> Result<(), ServerError> {
        let in_progress = {
            let mut state = self.lock_state();
            match *state {
                LifecycleState::Idle | LifecycleState::Binding => {
                    return Err(ServerError::NotListening)
                }
                LifecycleState::Closed => return Ok(()),
                LifecycleState::Closing => Some(self.closed.subscribe()),
                LifecycleState::Listening => {
                    *state = LifecycleState::Closing;
                    None
                }
            }
        };
        if let Some(mut closed) = in_progress {
            let _ = closed.wait_for(|closed| *closed).await;
            return Ok(());
        }
        tracing::info!("Graceful shutdown started");

        self.registry.mark_closing();
        let (funcs, futures) = self.registry.pending();
        tracing::debug!(funcs, futures, "Running shutdown functions");
        self.registry.run_funcs().await;

        self.stop.send_replace(true);
        for runtime in &self.runtimes {
            runtime.adapter.graceful();
        }

        join_all(self.runtimes.iter().map(|runtime| async move {
            runtime.adapter.wait_idle().await;
            tracing::debug!(listener = %runtime.listener_id, "Listener drained");
        }))
        .await;

        for frontend in &self.frontends {
            frontend.connections().wait_idle().await;
            frontend.cancel_sweep();
            tracing::debug!(frontend = frontend.name(), "TLS frontend closed");
        }

        self.registry.await_futures().await;

        let accept_loops = std::mem::take(&mut self.lock_running().accept_loops);
        join_all(accept_loops).await;

        self.mark_closed();
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Forced shutdown. Drops every connection, session and tunnel without
    /// waiting, and discards the shutdown registrations.
    pub fn destroy(&self) -> Result<(), ServerError> {
        {
            let mut state = self.lock_state();
            match *state {
                LifecycleState::Idle | LifecycleState::Binding => {
                    return Err(ServerError::NotListening)
                }
                LifecycleState::Closed => return Ok(()),
                LifecycleState::Listening | LifecycleState::Closing => {
                    *state = LifecycleState::Closed
                }
            }
        }
        tracing::warn!("Forced shutdown");

        self.registry.mark_closing();
        self.stop.send_replace(true);
        for handle in self.lock_running().accept_loops.drain(..) {
            handle.abort();
        }
        for runtime in &self.runtimes {
            runtime.adapter.force();
        }
        for frontend in &self.frontends {
            frontend.connections().force();
            frontend.cancel_sweep();
        }
        self.registry.clear();
        self.closed.send_replace(true);
        Ok(())
    }

    fn mark_closed(&self) {
        *self.lock_state() = LifecycleState::Closed;
        self.closed.send_replace(true);
    }

    fn runtime(&self, listener_id: &str) -> Option<(usize, &ListenerRuntime)> {
        self.runtimes
            .iter()
            .enumerate()
            .find(|(_, runtime)| runtime.listener_id == listener_id)
    }

    /// IDs of every listener, in declaration order.
    pub fn listener_ids(&self) -> impl Iterator<Item = &str> {
        self.runtimes.iter().map(|runtime| runtime.listener_id.as_str())
    }

    /// Address the socket serving `listener_id` is bound to.
    pub fn local_addr(&self, listener_id: &str) -> Option<SocketAddr> {
        let (index, _) = self.runtime(listener_id)?;
        self.lock_running().local_addrs.get(&index).copied()
    }

    /// Session cache of the TLS frontend serving `listener_id`.
    pub fn session_cache(&self, listener_id: &str) -> Option<Arc<SessionCache>> {
        let (_, runtime) = self.runtime(listener_id)?;
        runtime.frontend.as_ref()?.session_cache().cloned()
    }

    /// Whether `listener_id` shares its TLS socket with a sibling.
    pub fn is_demultiplexed(&self, listener_id: &str) -> bool {
        self.runtime(listener_id)
            .and_then(|(_, runtime)| runtime.frontend.as_ref())
            .is_some_and(|frontend| frontend.is_shared())
    }

    /// The shutdown registry handed to every request.
    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.registry
    }

    pub fn add_graceful_shutdown_func<F, Fut>(&self, func: F) -> ShutdownKey
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.add_graceful_shutdown_func(func)
    }

    pub fn remove_graceful_shutdown_func(&self, key: ShutdownKey) -> bool {
        self.registry.remove_graceful_shutdown_func(key)
    }

    pub fn add_graceful_shutdown_future<F>(&self, fut: F) -> ShutdownKey
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.registry.add_graceful_shutdown_future(fut)
    }

    pub fn remove_graceful_shutdown_future(&self, key: ShutdownKey) -> bool {
        self.registry.remove_graceful_shutdown_future(key)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if matches!(self.state(), LifecycleState::Listening | LifecycleState::Closing) {
            let _ = self.destroy();
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listeners", &self.runtimes.iter().map(|r| &r.listener_id).collect::<Vec<_>>())
            .field("sockets", &self.sockets.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Build the TLS frontend of one `[address]:port` group.
fn build_frontend(
    key: &str,
    members: &[usize],
    instances: &[ListenerSpec],
    runtimes: &[ListenerRuntime],
    reporter: &SharedReporter,
) -> Result<TlsFrontend, ConfigError> {
    let tls_of = |index: usize| instances[index].options.tls.clone().unwrap_or_default();

    let (name, opts, alpn, routes) = match *members {
        [primary, sibling, ..] => {
            let opts = tls::merge_group_options(&tls_of(primary), &tls_of(sibling));
            let (http1, http2) = if instances[primary].mode == ListenerMode::Http2 {
                (sibling, primary)
            } else {
                (primary, sibling)
            };
            tracing::info!(
                group = key,
                http1 = %runtimes[http1].listener_id,
                http2 = %runtimes[http2].listener_id,
                primary = %runtimes[primary].listener_id,
                "TLS group formed"
            );
            let routes = AlpnRoutes::Demux {
                http1: Arc::clone(&runtimes[http1].adapter),
                http2: Arc::clone(&runtimes[http2].adapter),
            };
            (key.to_string(), opts, GROUP_ALPN, routes)
        }
        [only] => {
            let alpn = if instances[only].mode == ListenerMode::Http2 {
                HTTP2_ALPN
            } else {
                HTTP1_ALPN
            };
            let routes = AlpnRoutes::Direct(Arc::clone(&runtimes[only].adapter));
            (runtimes[only].listener_id.clone(), tls_of(only), alpn, routes)
        }
        [] => unreachable!("a TLS group always has a member"),
    };

    let session_cache = tls::session_cache_for(&opts);
    let config = tls::build_server_config(&opts, alpn, session_cache.clone()).map_err(|source| {
        ConfigError::Tls {
            listener: name.clone(),
            source,
        }
    })?;

    Ok(TlsFrontend::new(
        name,
        config,
        routes,
        session_cache,
        Arc::clone(reporter),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsOptions;
    use crate::http::request::NormalizedRequest;

    fn handler() -> impl RequestListener {
        |req: NormalizedRequest| async move {
            let _ = req.respond("ok", ());
        }
    }

    fn tls() -> TlsOptions {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        TlsOptions::from_pem(cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[test]
    fn default_listener_ids_follow_declaration_order() {
        let server = Server::new(
            vec![
                ListenerSpec::http("127.0.0.1", 0),
                ListenerSpec::http("127.0.0.1", 0).with_id("api"),
            ],
            handler(),
        )
        .unwrap();
        let ids: Vec<_> = server.listener_ids().collect();
        assert_eq!(ids, vec!["listener-0", "api"]);
        assert_eq!(server.sockets.len(), 2);
    }

    #[test]
    fn tls_siblings_share_one_socket() {
        let server = Server::new(
            vec![
                ListenerSpec::tls(ListenerMode::Https, "127.0.0.1", 0, tls()).with_id("h1"),
                ListenerSpec::tls(ListenerMode::Http2, "127.0.0.1", 0, tls()).with_id("h2"),
                ListenerSpec::http("127.0.0.1", 0),
            ],
            handler(),
        )
        .unwrap();
        assert_eq!(server.sockets.len(), 2);
        assert_eq!(server.frontends.len(), 1);
        assert!(server.is_demultiplexed("h1"));
        assert!(server.is_demultiplexed("h2"));
        assert!(!server.is_demultiplexed("listener-2"));
    }

    #[test]
    fn tls_listener_without_certificate_is_rejected() {
        let mut bare = ListenerSpec::http("127.0.0.1", 0);
        bare.mode = ListenerMode::Http2;
        let err = Server::new(
            vec![ListenerSpec::tls(ListenerMode::Https, "127.0.0.1", 0, tls()), bare],
            handler(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn session_cache_follows_primary() {
        let mut with_cache = tls();
        with_cache.session_resumption_with_id = true;
        let server = Server::new(
            vec![
                ListenerSpec::tls(ListenerMode::Http2, "127.0.0.1", 0, with_cache).with_id("h2"),
                ListenerSpec::tls(ListenerMode::Https, "127.0.0.1", 0, tls()).with_id("h1"),
            ],
            handler(),
        )
        .unwrap();
        let a = server.session_cache("h1").unwrap();
        let b = server.session_cache("h2").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(server.session_cache("missing").is_none());
    }

    #[test]
    fn primary_without_certificate_borrows_siblings() {
        let bare = TlsOptions {
            session_resumption_with_id: true,
            ..TlsOptions::default()
        };
        let server = Server::new(
            vec![
                ListenerSpec::tls(ListenerMode::Https, "127.0.0.1", 0, bare).with_id("h1"),
                ListenerSpec::tls(ListenerMode::Http2, "127.0.0.1", 0, tls()).with_id("h2"),
            ],
            handler(),
        )
        .unwrap();
        assert_eq!(server.frontends.len(), 1);
        assert!(server.session_cache("h2").is_some());
    }

    #[test]
    fn invalid_configuration_fails_construction() {
        let err = Server::new(
            vec![ListenerSpec {
                mode: ListenerMode::Http3,
                ..ListenerSpec::http("127.0.0.1", 0)
            }],
            handler(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn unreadable_certificate_fails_construction() {
        let mut opts = TlsOptions::default();
        opts.cert_path = Some("/nonexistent/cert.pem".into());
        opts.key_path = Some("/nonexistent/key.pem".into());
        let err = Server::new(
            vec![ListenerSpec::tls(ListenerMode::Https, "127.0.0.1", 0, opts).with_id("tls")],
            handler(),
        )
        .unwrap_err();
        match err {
            ConfigError::Tls { listener, .. } => assert_eq!(listener, "tls"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_usage_errors() {
        let server = Server::new(vec![ListenerSpec::http("127.0.0.1", 0)], handler()).unwrap();
        assert!(matches!(server.close().await, Err(ServerError::NotListening)));
        assert!(matches!(server.destroy(), Err(ServerError::NotListening)));

        server.listen().await.unwrap();
        assert!(server.local_addr("listener-0").is_some());
        assert!(matches!(server.listen().await, Err(ServerError::AlreadyListening)));

        server.close().await.unwrap();
        assert_eq!(server.state(), LifecycleState::Closed);
        server.close().await.unwrap();
        server.destroy().unwrap();
        assert!(matches!(server.listen().await, Err(ServerError::Closed)));
    }

    #[tokio::test]
    async fn failed_bind_returns_to_idle() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = Server::new(vec![ListenerSpec::http("127.0.0.1", port)], handler()).unwrap();

        assert!(matches!(server.listen().await, Err(ServerError::Listener(_))));
        assert_eq!(server.state(), LifecycleState::Idle);
    }
}
