//! Durable store abstraction.
//!
//! The bus keeps its log in an external transactional key/value store. Only
//! a small set of primitives is required: integer counters, append-only
//! lists trimmed from the front, an optimistic "watch, then commit if
//! unchanged" transaction, and a publish/subscribe notification feed.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A notification feed was closed by the store.
    #[error("Notification feed disconnected")]
    Disconnected,

    /// Other store failure.
    #[error("Store error: {0}")]
    Other(String),
}

/// A consistent read of watched keys.
///
/// Carries the values the caller computes with, plus a version per key that
/// [`Store::commit`] checks before applying writes.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Counter values by key. Missing counters read as zero.
    pub counters: HashMap<String, u64>,
    /// List lengths by key. Missing lists read as empty.
    pub lengths: HashMap<String, usize>,
    /// Version of every watched key at read time.
    pub versions: HashMap<String, u64>,
}

impl Snapshot {
    /// Value of a watched counter.
    #[must_use]
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Length of a watched list.
    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.lengths.get(key).copied().unwrap_or(0)
    }
}

/// A write applied by [`Store::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Set a counter.
    SetCounter {
        /// Counter key.
        key: String,
        /// New value.
        value: u64,
    },
    /// Append to the end of a list.
    Push {
        /// List key.
        key: String,
        /// Value to append.
        value: Bytes,
    },
    /// Remove entries from the front of a list.
    TrimFront {
        /// List key.
        key: String,
        /// Number of entries to remove.
        count: usize,
    },
    /// Broadcast on a notification topic once the writes are applied.
    Publish {
        /// Notification topic.
        topic: String,
        /// Payload.
        payload: Bytes,
    },
}

/// An item from a notification feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A published payload.
    Payload(Bytes),
    /// The subscriber fell behind and this many notifications were lost.
    Lagged(u64),
}

/// A live notification feed for one topic.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Bytes>,
}

impl Subscription {
    /// Wrap a broadcast receiver.
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<Bytes>) -> Self {
        Self { receiver }
    }

    /// Wait for the next notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Disconnected`] once the feed is closed.
    pub async fn recv(&mut self) -> Result<Notification, StoreError> {
        match self.receiver.recv().await {
            Ok(payload) => Ok(Notification::Payload(payload)),
            Err(broadcast::error::RecvError::Lagged(missed)) => Ok(Notification::Lagged(missed)),
            Err(broadcast::error::RecvError::Closed) => Err(StoreError::Disconnected),
        }
    }
}

/// A transactional log store.
///
/// Implementations must make [`Store::commit`] atomic: either every write
/// is applied and every `Publish` is emitted, or nothing happens.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read counters and list lengths consistently, watching them for
    /// changes.
    async fn watch(&self, counters: &[&str], lists: &[&str]) -> Result<Snapshot, StoreError>;

    /// Apply `ops` if no key watched by `snapshot` changed since it was
    /// taken.
    ///
    /// Returns `false` on conflict. An empty `ops` only validates the
    /// snapshot.
    async fn commit(&self, snapshot: &Snapshot, ops: Vec<WriteOp>) -> Result<bool, StoreError>;

    /// Read list entries `start..end`, clamped to the list bounds.
    async fn range(&self, list: &str, start: usize, end: usize) -> Result<Vec<Bytes>, StoreError>;

    /// Broadcast a payload outside of a transaction.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), StoreError>;

    /// Open a notification feed.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError>;

    /// Delete every counter and list whose key starts with `prefix`.
    async fn clear(&self, prefix: &str) -> Result<(), StoreError>;

    /// Get the store name (e.g., "memory").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_defaults() {
        let snapshot = Snapshot::default();
        assert_eq!(snapshot.counter("missing"), 0);
        assert_eq!(snapshot.len("missing"), 0);
    }

    #[tokio::test]
    async fn test_subscription_reports_lag_and_close() {
        let (tx, rx) = broadcast::channel(1);
        let mut sub = Subscription::new(rx);

        tx.send(Bytes::from_static(b"a")).unwrap();
        tx.send(Bytes::from_static(b"b")).unwrap();

        assert_eq!(sub.recv().await.unwrap(), Notification::Lagged(1));
        assert_eq!(
            sub.recv().await.unwrap(),
            Notification::Payload(Bytes::from_static(b"b"))
        );

        drop(tx);
        assert!(matches!(sub.recv().await, Err(StoreError::Disconnected)));
    }
}
