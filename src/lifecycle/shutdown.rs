//! Shutdown registration for long-lived collaborators.
//!
//! # Responsibilities
//! - Let collaborators register trigger functions that `close()` runs first
//! - Let collaborators register completion futures that `close()` awaits last
//! - Broadcast the start of shutdown to anyone holding a handle
//!
//! # Design Decisions
//! - Registration returns a key; removal by key is O(n) over a small list
//! - Trigger functions run in registration order, one at a time
//! - Completion futures are awaited together

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::watch;

type TriggerFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Key returned by a registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShutdownKey(u64);

#[derive(Default)]
struct Registry {
    funcs: Vec<(ShutdownKey, TriggerFn)>,
    futures: Vec<(ShutdownKey, BoxFuture<'static, ()>)>,
}

struct RegistryInner {
    next_key: AtomicU64,
    registry: Mutex<Registry>,
    closing: watch::Sender<bool>,
}

/// Cloneable handle to a server's shutdown registry.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<RegistryInner>,
}

impl ShutdownHandle {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                next_key: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
                closing,
            }),
        }
    }

    fn next_key(&self) -> ShutdownKey {
        ShutdownKey(self.inner.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.registry.lock().expect("shutdown registry mutex poisoned")
    }

    /// Register a function run at the start of graceful shutdown.
    ///
    /// It should nudge a long-lived stream toward completion.
    pub fn add_graceful_shutdown_func<F, Fut>(&self, func: F) -> ShutdownKey
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = self.next_key();
        let func: TriggerFn = Box::new(move || func().boxed());
        self.lock().funcs.push((key, func));
        key
    }

    /// Unregister a trigger function. Returns whether it was registered.
    pub fn remove_graceful_shutdown_func(&self, key: ShutdownKey) -> bool {
        let mut registry = self.lock();
        let before = registry.funcs.len();
        registry.funcs.retain(|(k, _)| *k != key);
        registry.funcs.len() != before
    }

    /// Register a future that graceful shutdown waits for.
    pub fn add_graceful_shutdown_future<F>(&self, fut: F) -> ShutdownKey
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = self.next_key();
        self.lock().futures.push((key, fut.boxed()));
        key
    }

    /// Unregister a completion future. Returns whether it was registered.
    pub fn remove_graceful_shutdown_future(&self, key: ShutdownKey) -> bool {
        let mut registry = self.lock();
        let before = registry.futures.len();
        registry.futures.retain(|(k, _)| *k != key);
        registry.futures.len() != before
    }

    /// Whether shutdown has started.
    pub fn is_closing(&self) -> bool {
        *self.inner.closing.borrow()
    }

    /// Resolves once shutdown has started.
    pub async fn closing(&self) {
        let mut rx = self.inner.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    pub(crate) fn mark_closing(&self) {
        self.inner.closing.send_replace(true);
    }

    /// Run every registered trigger function in order.
    ///
    /// Functions registered while this runs are picked up too.
    pub(crate) async fn run_funcs(&self) {
        loop {
            let funcs = std::mem::take(&mut self.lock().funcs);
            if funcs.is_empty() {
                return;
            }
            for (_, func) in funcs {
                func().await;
            }
        }
    }

    /// Await every registered completion future.
    pub(crate) async fn await_futures(&self) {
        loop {
            let futures = std::mem::take(&mut self.lock().futures);
            if futures.is_empty() {
                return;
            }
            futures_util::future::join_all(futures.into_iter().map(|(_, f)| f)).await;
        }
    }

    /// Drop every registration without running it.
    pub(crate) fn clear(&self) {
        let mut registry = self.lock();
        registry.funcs.clear();
        registry.futures.clear();
    }

    /// Number of registered functions and futures.
    pub fn pending(&self) -> (usize, usize) {
        let registry = self.lock();
        (registry.funcs.len(), registry.futures.len())
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (funcs, futures) = self.pending();
        f.debug_struct("ShutdownHandle")
            .field("funcs", &funcs)
            .field("futures", &futures)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn funcs_run_in_order() {
        let handle = ShutdownHandle::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let log = log.clone();
            handle.add_graceful_shutdown_func(move || async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                log.lock().unwrap().push(n);
            });
        }

        handle.run_funcs().await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(handle.pending(), (0, 0));
    }

    #[tokio::test]
    async fn removed_registrations_do_not_run() {
        let handle = ShutdownHandle::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let key = handle.add_graceful_shutdown_func(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.remove_graceful_shutdown_func(key));
        assert!(!handle.remove_graceful_shutdown_func(key));

        let key = handle.add_graceful_shutdown_future(std::future::pending());
        assert!(handle.remove_graceful_shutdown_future(key));

        handle.run_funcs().await;
        tokio::time::timeout(Duration::from_secs(1), handle.await_futures())
            .await
            .expect("no futures left to wait for");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn await_futures_waits_for_all() {
        let handle = ShutdownHandle::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        handle.add_graceful_shutdown_future(async move {
            let _ = rx.await;
        });

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.await_futures().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closing_resolves_after_mark() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_closing());
        handle.mark_closing();
        assert!(handle.is_closing());
        tokio::time::timeout(Duration::from_millis(100), handle.closing())
            .await
            .unwrap();
    }
}
