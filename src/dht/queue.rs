use super::id::Id;
use crate::constants::SHUTDOWN_POLL_INTERVAL;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct QueueState<K, V> {
    items: VecDeque<(K, V)>,
    keys: HashSet<K>,
}

/// A bounded FIFO that holds each key at most once.
///
/// Pushing a key that is already waiting is a no-op, so a node announced by
/// many replies is contacted once per pass. Consumers block in
/// [`pop`](Self::pop) until an item arrives or the token is cancelled.
/// Pushes refused for lack of room are remembered until
/// [`take_overflow`](Self::take_overflow) so the producer can offer them again.
pub struct DistinctQueue<K, V> {
    state: Mutex<QueueState<K, V>>,
    ready: Condvar,
    capacity: usize,
    overflowed: AtomicBool,
}

impl<K: Eq + Hash + Clone, V> DistinctQueue<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                keys: HashSet::new(),
            }),
            ready: Condvar::new(),
            capacity,
            overflowed: AtomicBool::new(false),
        }
    }

    /// Returns false if the key is already queued or the queue is full.
    pub fn push(&self, key: K, value: V) -> bool {
        let mut state = self.state.lock();
        if state.keys.contains(&key) {
            return false;
        }
        if state.items.len() >= self.capacity {
            drop(state);
            if !self.overflowed.swap(true, Ordering::Relaxed) {
                debug!("queue full at {} items, dropping work", self.capacity);
            }
            return false;
        }
        state.keys.insert(key.clone());
        state.items.push_back((key, value));
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Blocks until an item is available; `None` once `cancel` fires.
    pub fn pop(&self, cancel: &CancellationToken) -> Option<V> {
        let mut state = self.state.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some((key, value)) = state.items.pop_front() {
                state.keys.remove(&key);
                return Some(value);
            }
            self.ready.wait_for(&mut state, SHUTDOWN_POLL_INTERVAL);
        }
    }

    pub fn try_pop(&self) -> Option<V> {
        let mut state = self.state.lock();
        let (key, value) = state.items.pop_front()?;
        state.keys.remove(&key);
        Some(value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a push was refused for capacity since the last call.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::Relaxed)
    }

    /// Wakes every blocked consumer so it can observe cancellation.
    pub fn wake_all(&self) {
        self.ready.notify_all();
    }
}

/// Remembers (endpoint, hash) pairs that refused to hand out a token.
///
/// Entries expire after `ttl`; the least recently used one is dropped when full.
pub struct RejectCache {
    entries: Mutex<LruCache<(SocketAddr, Id), Instant>>,
    ttl: Duration,
}

impl RejectCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn insert(&self, endpoint: SocketAddr, hash: Id) {
        self.entries.lock().put((endpoint, hash), Instant::now());
    }

    pub fn contains(&self, endpoint: &SocketAddr, hash: &Id) -> bool {
        let key = (*endpoint, hash.clone());
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                entries.pop(&key);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
