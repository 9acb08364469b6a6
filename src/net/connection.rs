//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections, streams and tunnels per tracker
//! - Broadcast the shutdown mode (graceful or forced) to every tracked task
//! - Drive hyper connections so they react to that broadcast
//!
//! # Design Decisions
//! - The count lives in a watch channel so waiting for zero needs no polling
//! - Signals only escalate: Running → Graceful → Force
//! - A forced connection is simply dropped, which closes its socket

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Shutdown mode broadcast to tracked tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownSignal {
    /// Serving normally.
    Running,
    /// Finish in-flight work, accept nothing new.
    Graceful,
    /// Terminate immediately.
    Force,
}

#[derive(Debug)]
struct TrackerInner {
    name: &'static str,
    active: watch::Sender<usize>,
    signal: watch::Sender<ShutdownSignal>,
}

/// Tracks a set of live connections (or streams, or tunnels).
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    /// Create a tracker. `name` only labels log events.
    pub fn new(name: &'static str) -> Self {
        let (active, _) = watch::channel(0);
        let (signal, _) = watch::channel(ShutdownSignal::Running);
        Self {
            inner: Arc::new(TrackerInner { name, active, signal }),
        }
    }

    /// Record a new live connection. The returned guard untracks it on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.inner.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            id: ConnectionId::new(),
            signal: self.inner.signal.subscribe(),
            seen: ShutdownSignal::Running,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current live count.
    pub fn active_count(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Current shutdown mode.
    pub fn signal(&self) -> ShutdownSignal {
        *self.inner.signal.borrow()
    }

    /// Ask every tracked task to finish its in-flight work.
    pub fn graceful(&self) {
        self.escalate(ShutdownSignal::Graceful);
    }

    /// Tell every tracked task to terminate now.
    pub fn force(&self) {
        self.escalate(ShutdownSignal::Force);
    }

    fn escalate(&self, to: ShutdownSignal) {
        let changed = self.inner.signal.send_if_modified(|current| {
            if *current < to {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(
                tracker = self.inner.name,
                active = self.active_count(),
                signal = ?to,
                "Shutdown signal sent"
            );
        }
    }

    /// Wait until nothing is tracked.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Guard held by a tracked task for its whole lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    signal: watch::Receiver<ShutdownSignal>,
    seen: ShutdownSignal,
    inner: Arc<TrackerInner>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for a shutdown signal stronger than any already returned.
    pub async fn next_signal(&mut self) -> ShutdownSignal {
        let seen = self.seen;
        let received = self.signal.wait_for(|s| *s > seen).await.map(|s| *s);
        let Ok(next) = received else {
            return std::future::pending().await;
        };
        self.seen = next;
        next
    }

    /// Wait for the forced-shutdown signal, ignoring graceful requests.
    pub async fn forced(&mut self) {
        let received = self.signal.wait_for(|s| *s == ShutdownSignal::Force).await.is_ok();
        if !received {
            std::future::pending::<()>().await;
        }
        self.seen = ShutdownSignal::Force;
    }

    /// Run `fut` unless forced shutdown arrives first.
    pub async fn unless_forced<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            out = fut => Some(out),
            _ = self.forced() => None,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(tracker = self.inner.name, connection_id = %self.id, "Untracked");
    }
}

/// Drive a hyper server connection to completion under a guard's shutdown
/// signal.
///
/// Graceful shutdown lets in-flight requests finish; forced shutdown drops the
/// connection. Evaluates to the connection's result, or `Ok(())` when it was
/// dropped. Works for any connection type with hyper's inherent
/// `graceful_shutdown(Pin<&mut Self>)`.
macro_rules! drive_connection {
    ($conn:expr, $guard:expr) => {{
        let conn = $conn;
        let guard: &mut $crate::net::connection::ConnectionGuard = $guard;
        tokio::pin!(conn);
        loop {
            tokio::select! {
                result = conn.as_mut() => break result,
                signal = guard.next_signal() => match signal {
                    $crate::net::connection::ShutdownSignal::Graceful => {
                        conn.as_mut().graceful_shutdown()
                    }
                    $crate::net::connection::ShutdownSignal::Force => {
                        tracing::debug!(connection_id = %guard.id(), "Connection dropped on forced shutdown");
                        break Ok(());
                    }
                    $crate::net::connection::ShutdownSignal::Running => {}
                },
            }
        }
    }};
}

pub(crate) use drive_connection;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new("test");
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn signals_only_escalate() {
        let tracker = ConnectionTracker::new("test");
        tracker.force();
        tracker.graceful();
        assert_eq!(tracker.signal(), ShutdownSignal::Force);
    }

    #[tokio::test]
    async fn guard_sees_each_signal_once() {
        let tracker = ConnectionTracker::new("test");
        let mut guard = tracker.track();

        tracker.graceful();
        assert_eq!(guard.next_signal().await, ShutdownSignal::Graceful);

        tracker.force();
        assert_eq!(guard.next_signal().await, ShutdownSignal::Force);

        let again = tokio::time::timeout(Duration::from_millis(50), guard.next_signal()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_last_guard() {
        let tracker = ConnectionTracker::new("test");
        let guard = tracker.track();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn unless_forced_cancels_work() {
        let tracker = ConnectionTracker::new("test");
        let mut guard = tracker.track();
        tracker.graceful();
        tracker.force();
        let out = guard.unless_forced(std::future::pending::<()>()).await;
        assert!(out.is_none());
    }
}
