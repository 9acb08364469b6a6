//! TLS session resumption cache.
//!
//! # Responsibilities
//! - Store server-side TLS sessions keyed by session ID
//! - Bound the number of entries (oldest-inserted evicted first)
//! - Expire entries that have not been used within `max_age`
//! - Plug into rustls as its `StoresServerSessions` backend
//!
//! # Design Decisions
//! - Insertion order lives in a side queue with lazy deletion so that
//!   `put`, `get` and eviction stay amortized O(1)
//! - Re-inserting an existing ID keeps its original queue position
//! - The sweep task only runs while the cache holds entries and holds a weak
//!   reference, so an abandoned cache never keeps a task alive
//! - Losing the cache only costs full handshakes; a miss is never an error

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rustls::server::StoresServerSessions;
use tokio::task::AbortHandle;

use crate::observability::metrics;

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    last_used: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Vec<u8>, Entry>,
    /// Insertion order. May hold stale records for removed entries.
    order: VecDeque<(u64, Vec<u8>)>,
    next_seq: u64,
    sweeper: Option<AbortHandle>,
}

impl CacheState {
    fn insert(&mut self, key: Vec<u8>, data: Vec<u8>, now: Instant, max_entries: usize) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.data = data;
            entry.last_used = now;
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((seq, key.clone()));
        self.entries.insert(key, Entry { data, last_used: now, seq });

        while self.entries.len() > max_entries {
            if !self.evict_oldest() {
                break;
            }
        }
        self.compact_if_sparse();
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((seq, key)) = self.order.pop_front() {
            let live = self.entries.get(&key).is_some_and(|e| e.seq == seq);
            if live {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    fn sweep(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_used) < max_age);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.compact();
        }
        removed
    }

    fn compact_if_sparse(&mut self) {
        if self.order.len() > self.entries.len() * 2 + 16 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
    }
}

/// Bounded, time-evicted store of TLS sessions.
pub struct SessionCache {
    state: Arc<Mutex<CacheState>>,
    max_entries: usize,
    max_age: Duration,
}

impl SessionCache {
    /// Create a cache holding at most `max_entries` sessions for `max_age`.
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            max_entries: max_entries.max(1),
            max_age,
        }
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a sweep task is currently scheduled.
    pub fn is_sweeping(&self) -> bool {
        self.lock().sweeper.is_some()
    }

    /// Look up a session, refreshing its last-used time on a hit.
    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let hit = state.entries.get_mut(key).map(|entry| {
            entry.last_used = Instant::now();
            entry.data.clone()
        });
        metrics::record_session_lookup(hit.is_some());
        hit
    }

    /// Insert or refresh a session.
    pub fn insert(&self, key: Vec<u8>, data: Vec<u8>) {
        let mut state = self.lock();
        state.insert(key, data, Instant::now(), self.max_entries);
        metrics::record_session_cache_size(state.entries.len());
        if state.sweeper.is_none() {
            state.sweeper = self.spawn_sweeper();
        }
    }

    /// Remove a session, returning it if present.
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock().entries.remove(key).map(|e| e.data)
    }

    /// Remove every entry unused for at least `max_age` as of `now`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        self.lock().sweep(now, self.max_age)
    }

    /// Stop the background sweep, if one is scheduled.
    pub fn cancel_sweep(&self) {
        if let Some(handle) = self.lock().sweeper.take() {
            handle.abort();
        }
    }

    fn spawn_sweeper(&self) -> Option<AbortHandle> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let weak = Arc::downgrade(&self.state);
        let max_age = self.max_age;
        let task = runtime.spawn(sweep_loop(weak, max_age));
        Some(task.abort_handle())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("session cache mutex poisoned")
    }
}

async fn sweep_loop(weak: Weak<Mutex<CacheState>>, max_age: Duration) {
    loop {
        tokio::time::sleep(max_age).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut state = shared.lock().expect("session cache mutex poisoned");
        let removed = state.sweep(Instant::now(), max_age);
        if removed > 0 {
            tracing::debug!(removed, remaining = state.entries.len(), "Session cache swept");
        }
        metrics::record_session_cache_size(state.entries.len());
        if state.entries.is_empty() {
            state.sweeper = None;
            return;
        }
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.cancel_sweep();
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl StoresServerSessions for SessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.insert(key, value);
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lookup(key)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let taken = self.remove(key);
        metrics::record_session_lookup(taken.is_some());
        taken
    }

    fn can_cache(&self) -> bool {
        true
    }
}
