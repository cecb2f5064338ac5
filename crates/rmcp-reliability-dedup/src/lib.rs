// SPDX-License-Identifier: MIT OR Apache-2.0
//! rmcp-reliability-dedup
#![deny(unsafe_code)]
//!
//! The Deduplication Cache: the first caller with a given idempotency key
//! becomes the *leader* and computes the result; concurrent callers with
//! the same key become *followers* and await the leader's shared
//! completion instead of re-executing the underlying tool call.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rmcp_reliability_error::ReliabilityError;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

type SharedResult<T> = Arc<Result<T, ReliabilityError>>;

/// One key's dedup state: a broadcast channel for in-flight followers and
/// a cached slot for callers that arrive after completion.
struct Entry<T> {
    inserted_at: Instant,
    tx: broadcast::Sender<SharedResult<T>>,
    cached: StdMutex<Option<SharedResult<T>>>,
}

struct State<T> {
    entries: BTreeMap<String, Arc<Entry<T>>>,
    order: VecDeque<String>,
}

/// Bounded, time-windowed deduplication cache keyed by idempotency key.
///
/// `T` is the value type cached per key (typically a small, cheaply
/// cloneable outcome type such as one that wraps its payload in an
/// `Arc`); it must be `Clone` so that every follower can own its copy.
pub struct DedupCache<T> {
    state: Arc<StdMutex<State<T>>>,
    window: Duration,
    capacity: usize,
}

impl<T> Clone for DedupCache<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            window: self.window,
            capacity: self.capacity,
        }
    }
}

/// The role returned by [`DedupCache::acquire`].
pub enum DedupTicket<T: Clone + Send + Sync + 'static> {
    /// This caller is responsible for computing the result.
    Leader(LeaderTicket<T>),
    /// Another caller is already computing the result for this key.
    Follower(FollowerTicket<T>),
}

/// Held by the caller responsible for executing the underlying tool call.
pub struct LeaderTicket<T: Clone + Send + Sync + 'static> {
    cache: DedupCache<T>,
    key: String,
    entry: Arc<Entry<T>>,
}

impl<T: Clone + Send + Sync + 'static> LeaderTicket<T> {
    /// Publish the result to any waiting followers and, on success, pin it
    /// in the cache for the remainder of the window. On failure the entry
    /// is removed so a later retry under the same key is not poisoned.
    pub fn complete(self, result: Result<T, ReliabilityError>) {
        let shared: SharedResult<T> = Arc::new(result);
        let _ = self.entry.tx.send(Arc::clone(&shared));

        match shared.as_ref() {
            Ok(_) => {
                *self.entry.cached.lock().expect("dedup entry lock poisoned") =
                    Some(shared);
                debug!(key = %self.key, "dedup leader pinned successful result");
            }
            Err(_) => {
                self.cache.remove_if_matches(&self.key, &self.entry);
                debug!(key = %self.key, "dedup leader removed entry after terminal failure");
            }
        }
    }

    /// The key this ticket is leading for cancellation bookkeeping.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Held by a caller that must await the leader's shared result.
pub struct FollowerTicket<T: Clone + Send + Sync + 'static> {
    entry: Arc<Entry<T>>,
}

impl<T: Clone + Send + Sync + 'static> FollowerTicket<T> {
    /// Await the leader's completion. Subscribes before checking the
    /// cached slot so a completion racing with this call is never missed:
    /// either the cache read observes it, or the broadcast subscription
    /// (registered first) delivers it.
    pub async fn wait(&self) -> Result<T, ReliabilityError> {
        let mut rx = self.entry.tx.subscribe();

        if let Some(cached) = self
            .entry
            .cached
            .lock()
            .expect("dedup entry lock poisoned")
            .clone()
        {
            return clone_result(&cached);
        }

        match rx.recv().await {
            Ok(result) => clone_result(&result),
            Err(_) => Err(ReliabilityError::cancelled(
                "dedup leader disappeared before completing",
            )),
        }
    }
}

fn clone_result<T: Clone>(shared: &SharedResult<T>) -> Result<T, ReliabilityError> {
    match shared.as_ref() {
        Ok(value) => Ok(value.clone()),
        Err(err) => Err(ReliabilityError::new(err.code(), err.message().to_string())
            .retryable(err.is_retryable())),
    }
}

impl<T: Clone + Send + Sync + 'static> DedupCache<T> {
    #[must_use]
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            state: Arc::new(StdMutex::new(State {
                entries: BTreeMap::new(),
                order: VecDeque::new(),
            })),
            window,
            capacity,
        }
    }

    /// Acquire a ticket for `key`, becoming the leader if no live entry
    /// exists (or a previous one has expired), or a follower otherwise.
    ///
    /// A `capacity` of zero disables the cache: every caller becomes its
    /// own leader and nothing is ever stored.
    pub fn acquire(&self, key: &str) -> DedupTicket<T> {
        if self.capacity == 0 {
            let (tx, _rx) = broadcast::channel(1);
            let entry = Arc::new(Entry {
                inserted_at: Instant::now(),
                tx,
                cached: StdMutex::new(None),
            });
            return DedupTicket::Leader(LeaderTicket {
                cache: self.clone(),
                key: key.to_string(),
                entry,
            });
        }

        let mut state = self.state.lock().expect("dedup cache lock poisoned");

        if let Some(entry) = state.entries.get(key) {
            if entry.inserted_at.elapsed() <= self.window {
                trace!(key, "dedup follower joining live entry");
                return DedupTicket::Follower(FollowerTicket {
                    entry: Arc::clone(entry),
                });
            }
            state.entries.remove(key);
            state.order.retain(|k| k != key);
        }

        if state.entries.len() >= self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
                trace!(evicted = %oldest, "dedup cache evicted oldest entry at capacity");
            }
        }

        let (tx, _rx) = broadcast::channel(1);
        let entry = Arc::new(Entry {
            inserted_at: Instant::now(),
            tx,
            cached: StdMutex::new(None),
        });
        state.entries.insert(key.to_string(), Arc::clone(&entry));
        state.order.push_back(key.to_string());

        DedupTicket::Leader(LeaderTicket {
            cache: self.clone(),
            key: key.to_string(),
            entry,
        })
    }

    fn remove_if_matches(&self, key: &str, entry: &Arc<Entry<T>>) {
        let mut state = self.state.lock().expect("dedup cache lock poisoned");
        if let Some(current) = state.entries.get(key)
            && Arc::ptr_eq(current, entry)
        {
            state.entries.remove(key);
            state.order.retain(|k| k != key);
        }
    }

    /// Number of live entries currently tracked (not all necessarily
    /// still within the window; expired entries are lazily reaped on
    /// next `acquire`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("dedup cache lock poisoned").entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry. Used by `close()`.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("dedup cache lock poisoned");
        state.entries.clear();
        state.order.clear();
    }
}
