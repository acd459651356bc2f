//! Embedded in-memory store.
//!
//! Implements the full [`Store`] contract inside the process: versioned keys
//! for optimistic transactions and `tokio::sync::broadcast` topics for the
//! notification feed. It also supports fault injection so the bus's retry
//! and gap-repair paths can be exercised deterministically.

use super::{Snapshot, Store, StoreError, Subscription, WriteOp};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

/// Default notification buffer per topic.
const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct State {
    counters: HashMap<String, u64>,
    lists: HashMap<String, VecDeque<Bytes>>,
    versions: HashMap<String, u64>,
    topics: HashMap<String, broadcast::Sender<Bytes>>,
}

impl State {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// In-memory implementation of [`Store`].
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    notification_capacity: usize,
    failures: AtomicUsize,
    conflicts: AtomicUsize,
    dropped_notifications: AtomicUsize,
    commit_attempts: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_notification_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    /// Create an empty store with a specific notification buffer per topic.
    ///
    /// Subscribers that fall further behind than this see
    /// [`Notification::Lagged`](super::Notification::Lagged).
    #[must_use]
    pub fn with_notification_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notification_capacity: capacity.max(1),
            failures: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
            dropped_notifications: AtomicUsize::new(0),
            commit_attempts: AtomicU64::new(0),
        }
    }

    /// Make the next `count` operations fail with [`StoreError::Unavailable`].
    pub fn inject_failures(&self, count: usize) {
        self.failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Make the next `count` otherwise valid commits report a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Silently drop the next `count` notifications.
    pub fn drop_notifications(&self, count: usize) {
        self.dropped_notifications.fetch_add(count, Ordering::SeqCst);
    }

    /// Close every open notification feed.
    pub async fn disconnect_subscribers(&self) {
        let mut state = self.state.lock().await;
        let closed = state.topics.len();
        state.topics.clear();
        debug!(topics = closed, "Disconnected all subscribers");
    }

    /// Number of commits attempted so far, including conflicting ones.
    #[must_use]
    pub fn commit_attempts(&self) -> u64 {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if take_one(&self.failures) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn broadcast(&self, state: &State, topic: &str, payload: Bytes) {
        if take_one(&self.dropped_notifications) {
            trace!(topic = %topic, "Dropping notification");
            return;
        }
        if let Some(sender) = state.topics.get(topic) {
            // No receivers is not an error for a fire-and-forget feed.
            let _ = sender.send(payload);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Store for MemoryStore {
    async fn watch(&self, counters: &[&str], lists: &[&str]) -> Result<Snapshot, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;

        let mut snapshot = Snapshot::default();
        for key in counters {
            let value = state.counters.get(*key).copied().unwrap_or(0);
            snapshot.counters.insert((*key).to_string(), value);
            snapshot.versions.insert((*key).to_string(), state.version(key));
        }
        for key in lists {
            let len = state.lists.get(*key).map_or(0, VecDeque::len);
            snapshot.lengths.insert((*key).to_string(), len);
            snapshot.versions.insert((*key).to_string(), state.version(key));
        }

        Ok(snapshot)
    }

    async fn commit(&self, snapshot: &Snapshot, ops: Vec<WriteOp>) -> Result<bool, StoreError> {
        self.check_available()?;
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        let unchanged = snapshot
            .versions
            .iter()
            .all(|(key, version)| state.version(key) == *version);
        if !unchanged || take_one(&self.conflicts) {
            return Ok(false);
        }

        let mut notifications = Vec::new();
        for op in ops {
            match op {
                WriteOp::SetCounter { key, value } => {
                    state.bump(&key);
                    state.counters.insert(key, value);
                }
                WriteOp::Push { key, value } => {
                    state.bump(&key);
                    state.lists.entry(key).or_default().push_back(value);
                }
                WriteOp::TrimFront { key, count } => {
                    state.bump(&key);
                    if let Some(list) = state.lists.get_mut(&key) {
                        let count = count.min(list.len());
                        list.drain(..count);
                    }
                }
                WriteOp::Publish { topic, payload } => notifications.push((topic, payload)),
            }
        }

        for (topic, payload) in notifications {
            self.broadcast(&state, &topic, payload);
        }

        Ok(true)
    }

    async fn range(&self, list: &str, start: usize, end: usize) -> Result<Vec<Bytes>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;

        Ok(state
            .lists
            .get(list)
            .map(|entries| {
                entries
                    .iter()
                    .skip(start)
                    .take(end.saturating_sub(start))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        self.broadcast(&state, topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let capacity = self.notification_capacity;
        let sender = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);

        Ok(Subscription::new(sender.subscribe()))
    }

    async fn clear(&self, prefix: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let doomed: Vec<String> = state
            .counters
            .keys()
            .chain(state.lists.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        for key in &doomed {
            state.counters.remove(key);
            state.lists.remove(key);
            state.bump(key);
        }

        debug!(prefix = %prefix, keys = doomed.len(), "Cleared keys");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
