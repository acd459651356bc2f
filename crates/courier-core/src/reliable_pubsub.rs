//! Durable, ordered pub/sub log.
//!
//! Each channel has its own backlog list plus an offset counter (the number
//! of entries trimmed from its front). A compact global backlog records
//! `(message_id, channel)` for every publish on the partition so a
//! reconnecting subscriber can replay everything it missed without knowing
//! the channels in advance.
//!
//! Every mutation is one optimistic transaction: watch the counters and
//! lists involved, compute the new ids, and commit only if nothing changed
//! in between. Conflicts are retried, so concurrent publishers never hand
//! out the same `message_id` for a channel.

use crate::channel::{validate_channel_name, KeySpace};
use crate::store::{Store, StoreError, WriteOp};
use crate::subscriber::RESTART;
use bytes::Bytes;
use courier_protocol::{codec, GlobalEntry, GlobalId, Message, MessageId, ProtocolError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Pub/sub errors.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Stored data is not a valid message.
    #[error("Malformed stored message: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Pub/sub configuration.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Partition served by this instance.
    pub site_id: Option<String>,
    /// Maximum retained messages per channel.
    pub max_backlog_size: usize,
    /// Maximum retained entries in the global backlog.
    pub max_global_backlog_size: usize,
    /// Delay before a failed live subscription is retried.
    pub reconnect_delay: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            site_id: None,
            max_backlog_size: 1000,
            max_global_backlog_size: 100_000,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Restrict delivery to these users.
    pub user_ids: Option<BTreeSet<u64>>,
    /// Override the channel's retained backlog size for this publish.
    pub max_backlog_size: Option<usize>,
}

impl PublishOptions {
    /// Deliver only to the given users.
    #[must_use]
    pub fn for_users(user_ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            user_ids: Some(user_ids.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Override the retained backlog size.
    #[must_use]
    pub fn with_max_backlog_size(mut self, size: usize) -> Self {
        self.max_backlog_size = Some(size);
        self
    }
}

/// The durable log engine for one partition.
pub struct ReliablePubSub {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) keys: KeySpace,
    pub(crate) config: PubSubConfig,
}

impl ReliablePubSub {
    /// Create a pub/sub log with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, PubSubConfig::default())
    }

    /// Create a pub/sub log with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn Store>, config: PubSubConfig) -> Self {
        info!(store = store.name(), "Creating reliable pubsub with config: {:?}", config);
        Self {
            keys: KeySpace::new(config.site_id.as_deref()),
            store,
            config,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Get the store backend name.
    #[must_use]
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Get the partition served by this instance.
    #[must_use]
    pub fn site_id(&self) -> Option<&str> {
        self.config.site_id.as_deref()
    }

    /// Publish a message to a channel.
    ///
    /// Returns the new `message_id`, which is exactly one greater than the
    /// previous message on the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or the store fails.
    /// Transaction conflicts are retried, never returned.
    pub async fn publish(
        &self,
        channel: &str,
        data: impl Into<String>,
        options: PublishOptions,
    ) -> Result<MessageId, PubSubError> {
        validate_channel_name(channel).map_err(PubSubError::InvalidChannel)?;

        let data = data.into();
        let max_backlog = options
            .max_backlog_size
            .unwrap_or(self.config.max_backlog_size)
            .max(1);
        let max_global_backlog = self.config.max_global_backlog_size.max(1);

        let backlog_key = self.keys.backlog(channel);
        let offset_key = self.keys.offset(channel);
        let global_backlog_key = self.keys.global_backlog();
        let global_offset_key = self.keys.global_offset();
        let global_id_key = self.keys.global_id();

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let snapshot = self
                .store
                .watch(
                    &[offset_key.as_str(), global_offset_key, global_id_key],
                    &[backlog_key.as_str(), global_backlog_key],
                )
                .await?;

            let offset = snapshot.counter(&offset_key);
            let len = snapshot.len(&backlog_key);
            let global_offset = snapshot.counter(global_offset_key);
            let global_len = snapshot.len(global_backlog_key);

            let global_id = snapshot.counter(global_id_key) + 1;
            let message_id = offset + len as u64 + 1;

            let mut message = Message::new(global_id, message_id, channel, data.clone());
            message.user_ids.clone_from(&options.user_ids);
            let encoded = codec::encode_bytes(&message);

            let mut ops = Vec::with_capacity(8);
            push_trim(&mut ops, &backlog_key, &offset_key, offset, len, max_backlog);
            push_trim(
                &mut ops,
                global_backlog_key,
                global_offset_key,
                global_offset,
                global_len,
                max_global_backlog,
            );
            ops.push(WriteOp::Push {
                key: backlog_key.clone(),
                value: encoded.clone(),
            });
            ops.push(WriteOp::Push {
                key: global_backlog_key.to_string(),
                value: GlobalEntry::new(message_id, channel).encode(),
            });
            ops.push(WriteOp::SetCounter {
                key: global_id_key.to_string(),
                value: global_id,
            });
            ops.push(WriteOp::Publish {
                topic: self.keys.notifications().to_string(),
                payload: encoded,
            });

            if self.store.commit(&snapshot, ops).await? {
                debug!(
                    channel = %channel,
                    message_id,
                    global_id,
                    bytes = message.payload_size(),
                    attempts,
                    "Published"
                );
                return Ok(message_id);
            }

            trace!(channel = %channel, attempts, "Publish conflicted, retrying");
        }
    }

    /// Get the id of the newest message on a channel, or 0 if none was ever
    /// published.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn last_id(&self, channel: &str) -> Result<MessageId, PubSubError> {
        let offset_key = self.keys.offset(channel);
        let backlog_key = self.keys.backlog(channel);

        loop {
            let snapshot = self.store.watch(&[offset_key.as_str()], &[backlog_key.as_str()]).await?;
            // An empty commit confirms both values belong to one point in time.
            if self.store.commit(&snapshot, Vec::new()).await? {
                return Ok(snapshot.counter(&offset_key) + snapshot.len(&backlog_key) as u64);
            }
        }
    }

    /// Get the newest message id of several channels, in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn last_ids(&self, channels: &[&str]) -> Result<Vec<MessageId>, PubSubError> {
        let mut ids = Vec::with_capacity(channels.len());
        for channel in channels {
            ids.push(self.last_id(channel).await?);
        }
        Ok(ids)
    }

    /// Get the newest global id of the partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn global_last_id(&self) -> Result<GlobalId, PubSubError> {
        let key = self.keys.global_id();
        let snapshot = self.store.watch(&[key], &[]).await?;
        Ok(snapshot.counter(key))
    }

    /// Get every retained message of a channel after `last_id`.
    ///
    /// Messages already trimmed are simply absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or holds malformed data.
    pub async fn backlog(
        &self,
        channel: &str,
        last_id: Option<MessageId>,
    ) -> Result<Vec<Message>, PubSubError> {
        let last_id = last_id.unwrap_or(0);
        let entries = self
            .read_after(&self.keys.offset(channel), &self.keys.backlog(channel), last_id)
            .await?;

        entries.iter().map(|raw| self.decode(raw)).collect()
    }

    /// Get every retained message of the partition after global id
    /// `last_id`, in global order.
    ///
    /// Entries whose channel message was trimmed since are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or holds malformed data.
    pub async fn global_backlog(
        &self,
        last_id: Option<GlobalId>,
    ) -> Result<Vec<Message>, PubSubError> {
        let last_id = last_id.unwrap_or(0);
        let entries = self
            .read_after(self.keys.global_offset(), self.keys.global_backlog(), last_id)
            .await?;

        let mut messages = Vec::with_capacity(entries.len());
        for raw in &entries {
            let entry = GlobalEntry::decode(raw)?;
            match self.get_message(&entry.channel, entry.message_id).await? {
                Some(message) => messages.push(message),
                None => trace!(
                    channel = %entry.channel,
                    message_id = entry.message_id,
                    "Skipping trimmed message"
                ),
            }
        }

        Ok(messages)
    }

    /// Look up one message by id.
    ///
    /// Returns `None` if it was trimmed or not yet published.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or holds malformed data.
    pub async fn get_message(
        &self,
        channel: &str,
        message_id: MessageId,
    ) -> Result<Option<Message>, PubSubError> {
        let offset_key = self.keys.offset(channel);
        let backlog_key = self.keys.backlog(channel);

        loop {
            let snapshot = self.store.watch(&[offset_key.as_str()], &[backlog_key.as_str()]).await?;
            let offset = snapshot.counter(&offset_key);
            let len = snapshot.len(&backlog_key) as u64;

            if message_id <= offset || message_id > offset + len {
                return Ok(None);
            }

            let index = to_index(message_id - 1 - offset);
            let entries = self.store.range(&backlog_key, index, index + 1).await?;
            if self.store.commit(&snapshot, Vec::new()).await? {
                return entries.first().map(|raw| self.decode(raw)).transpose();
            }
        }
    }

    /// Delete every message, counter and backlog of this partition.
    ///
    /// Live subscribers are told to rewind, so they follow the log again
    /// from global id 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn reset(&self) -> Result<(), PubSubError> {
        for prefix in self.keys.owned_prefixes() {
            self.store.clear(&prefix).await?;
        }
        self.store
            .publish(self.keys.notifications(), Bytes::from_static(RESTART))
            .await?;
        info!(site = ?self.config.site_id, "Reset message log");
        Ok(())
    }

    /// Read the entries of a trimmed list whose ids are above `last_id`,
    /// consistently with its offset.
    async fn read_after(
        &self,
        offset_key: &str,
        list_key: &str,
        last_id: u64,
    ) -> Result<Vec<Bytes>, PubSubError> {
        loop {
            let snapshot = self.store.watch(&[offset_key], &[list_key]).await?;
            let offset = snapshot.counter(offset_key);
            let len = snapshot.len(list_key);

            // The entry with id `n` sits at index `n - 1 - offset`.
            let start = to_index(last_id.saturating_sub(offset));
            if start >= len {
                return Ok(Vec::new());
            }

            let entries = self.store.range(list_key, start, len).await?;
            if self.store.commit(&snapshot, Vec::new()).await? {
                return Ok(entries);
            }
            trace!(list = %list_key, "Backlog changed during read, retrying");
        }
    }

    pub(crate) fn decode(&self, raw: &[u8]) -> Result<Message, PubSubError> {
        Ok(codec::decode_bytes(raw)?.with_site_id(self.config.site_id.clone()))
    }
}

/// Queue the writes that keep a list at `max` entries after one more push.
fn push_trim(
    ops: &mut Vec<WriteOp>,
    list_key: &str,
    offset_key: &str,
    offset: u64,
    len: usize,
    max: usize,
) {
    let excess = (len + 1).saturating_sub(max);
    if excess > 0 {
        ops.push(WriteOp::TrimFront {
            key: list_key.to_string(),
            count: excess,
        });
        ops.push(WriteOp::SetCounter {
            key: offset_key.to_string(),
            value: offset + excess as u64,
        });
    }
}

fn to_index(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn pubsub() -> (Arc<MemoryStore>, ReliablePubSub) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ReliablePubSub::new(store))
    }

    fn pubsub_with_backlog(max_backlog_size: usize) -> ReliablePubSub {
        let config = PubSubConfig {
            max_backlog_size,
            ..PubSubConfig::default()
        };
        ReliablePubSub::with_config(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_publish_assigns_sequential_ids() {
        let (_, pubsub) = pubsub();

        assert_eq!(pubsub.last_id("/test").await.unwrap(), 0);
        assert_eq!(pubsub.publish("/test", "hello", PublishOptions::default()).await.unwrap(), 1);
        assert_eq!(pubsub.last_id("/test").await.unwrap(), 1);

        assert_eq!(pubsub.publish("/other", "x", PublishOptions::default()).await.unwrap(), 1);
        assert_eq!(pubsub.publish("/test", "again", PublishOptions::default()).await.unwrap(), 2);

        let backlog = pubsub.backlog("/test", Some(0)).await.unwrap();
        let ids: Vec<_> = backlog.iter().map(|m| (m.message_id, m.global_id)).collect();
        assert_eq!(ids, vec![(1, 1), (2, 3)]);
        assert_eq!(backlog[0].data, "hello");

        assert_eq!(pubsub.global_last_id().await.unwrap(), 3);
        assert_eq!(pubsub.last_ids(&["/test", "/other", "/none"]).await.unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_backlog_after_last_id() {
        let (_, pubsub) = pubsub();
        for i in 1..=4 {
            pubsub.publish("/c", format!("m{i}"), PublishOptions::default()).await.unwrap();
        }

        let after_two: Vec<_> = pubsub
            .backlog("/c", Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.data)
            .collect();
        assert_eq!(after_two, vec!["m3", "m4"]);

        assert_eq!(pubsub.backlog("/c", None).await.unwrap().len(), 4);
        assert!(pubsub.backlog("/c", Some(4)).await.unwrap().is_empty());
        assert!(pubsub.backlog("/c", Some(99)).await.unwrap().is_empty());
        assert!(pubsub.backlog("/empty", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trimming_drops_oldest_messages() {
        let pubsub = pubsub_with_backlog(2);
        for i in 1..=5 {
            let id = pubsub.publish("/c", format!("m{i}"), PublishOptions::default()).await.unwrap();
            assert_eq!(id, i);
        }

        let backlog = pubsub.backlog("/c", Some(0)).await.unwrap();
        let ids: Vec<_> = backlog.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![4, 5]);

        assert!(pubsub.get_message("/c", 2).await.unwrap().is_none());
        assert!(pubsub.get_message("/c", 3).await.unwrap().is_none());
        assert_eq!(pubsub.get_message("/c", 4).await.unwrap().unwrap().data, "m4");
        assert_eq!(pubsub.last_id("/c").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_per_publish_backlog_override() {
        let (_, pubsub) = pubsub();
        for _ in 0..5 {
            pubsub.publish("/c", "x", PublishOptions::default()).await.unwrap();
        }

        let options = PublishOptions::default().with_max_backlog_size(1);
        assert_eq!(pubsub.publish("/c", "last", options).await.unwrap(), 6);

        let backlog = pubsub.backlog("/c", None).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].message_id, 6);
    }

    #[tokio::test]
    async fn test_get_message_bounds() {
        let (_, pubsub) = pubsub();
        pubsub.publish("/c", "one", PublishOptions::default()).await.unwrap();

        assert!(pubsub.get_message("/c", 0).await.unwrap().is_none());
        assert_eq!(pubsub.get_message("/c", 1).await.unwrap().unwrap().data, "one");
        assert!(pubsub.get_message("/c", 2).await.unwrap().is_none());
        assert!(pubsub.get_message("/missing", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_global_backlog_orders_channels_and_skips_trimmed() {
        let pubsub = pubsub_with_backlog(1);

        pubsub.publish("/a", "a1", PublishOptions::default()).await.unwrap();
        pubsub.publish("/b", "b1", PublishOptions::default()).await.unwrap();
        pubsub.publish("/a", "a2", PublishOptions::default()).await.unwrap();
        pubsub.publish("/c", "c1", PublishOptions::default()).await.unwrap();

        // "a1" was trimmed from its channel, so its global entry resolves to nothing.
        let all: Vec<_> = pubsub
            .global_backlog(None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.global_id, m.data))
            .collect();
        assert_eq!(
            all,
            vec![(2, "b1".to_string()), (3, "a2".to_string()), (4, "c1".to_string())]
        );

        let after: Vec<_> = pubsub
            .global_backlog(Some(3))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.global_id)
            .collect();
        assert_eq!(after, vec![4]);
    }

    #[tokio::test]
    async fn test_global_backlog_trimming() {
        let config = PubSubConfig {
            max_global_backlog_size: 2,
            ..PubSubConfig::default()
        };
        let pubsub = ReliablePubSub::with_config(Arc::new(MemoryStore::new()), config);
        for i in 0..5 {
            pubsub.publish(&format!("/c{i}"), "x", PublishOptions::default()).await.unwrap();
        }

        let ids: Vec<_> = pubsub
            .global_backlog(Some(0))
            .await
            .unwrap()
            .iter()
            .map(|m| m.global_id)
            .collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(pubsub.global_last_id().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let (store, pubsub) = pubsub();
        store.inject_conflicts(3);

        assert_eq!(pubsub.publish("/c", "x", PublishOptions::default()).await.unwrap(), 1);
        assert_eq!(store.commit_attempts(), 4);
        assert_eq!(pubsub.last_id("/c").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishers_never_share_ids() {
        let (_, pubsub) = pubsub();
        let pubsub = Arc::new(pubsub);

        let mut handles = Vec::new();
        for i in 0..64 {
            let pubsub = pubsub.clone();
            handles.push(tokio::spawn(async move {
                pubsub
                    .publish("/busy", format!("m{i}"), PublishOptions::default())
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=64).collect::<Vec<u64>>());

        let global: Vec<_> = pubsub
            .global_backlog(None)
            .await
            .unwrap()
            .iter()
            .map(|m| m.global_id)
            .collect();
        assert_eq!(global, (1..=64).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_user_filter_and_site_are_preserved() {
        let config = PubSubConfig {
            site_id: Some("forum".into()),
            ..PubSubConfig::default()
        };
        let pubsub = ReliablePubSub::with_config(Arc::new(MemoryStore::new()), config);

        pubsub
            .publish("/private", "#secret", PublishOptions::for_users([7, 3]))
            .await
            .unwrap();

        let message = pubsub.get_message("/private", 1).await.unwrap().unwrap();
        assert_eq!(message.data, "#secret");
        assert_eq!(message.site_id.as_deref(), Some("forum"));
        assert!(message.is_allowed_for(Some(3)));
        assert!(!message.is_allowed_for(Some(4)));
    }

    #[tokio::test]
    async fn test_sites_do_not_share_logs() {
        let store = Arc::new(MemoryStore::new());
        let site_a = ReliablePubSub::with_config(
            store.clone(),
            PubSubConfig {
                site_id: Some("a".into()),
                ..PubSubConfig::default()
            },
        );
        let site_b = ReliablePubSub::with_config(
            store,
            PubSubConfig {
                site_id: Some("b".into()),
                ..PubSubConfig::default()
            },
        );

        site_a.publish("/c", "x", PublishOptions::default()).await.unwrap();
        assert_eq!(site_a.last_id("/c").await.unwrap(), 1);
        assert_eq!(site_b.last_id("/c").await.unwrap(), 0);

        site_a.reset().await.unwrap();
        assert_eq!(site_a.last_id("/c").await.unwrap(), 0);
        assert_eq!(site_a.global_last_id().await.unwrap(), 0);
        assert_eq!(site_a.publish("/c", "y", PublishOptions::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_leaves_sites_with_similar_names() {
        let store = Arc::new(MemoryStore::new());
        let site = |name: &str| {
            ReliablePubSub::with_config(
                store.clone(),
                PubSubConfig {
                    site_id: Some(name.into()),
                    ..PubSubConfig::default()
                },
            )
        };
        let short = site("x");
        let nested = site("x:backlog:y");

        nested.publish("/c", "kept", PublishOptions::default()).await.unwrap();
        short.publish("/c", "gone", PublishOptions::default()).await.unwrap();

        short.reset().await.unwrap();
        assert_eq!(short.last_id("/c").await.unwrap(), 0);
        assert_eq!(nested.last_id("/c").await.unwrap(), 1);
        assert_eq!(nested.global_last_id().await.unwrap(), 1);
        assert_eq!(nested.get_message("/c", 1).await.unwrap().unwrap().data, "kept");
    }

    #[tokio::test]
    async fn test_invalid_channels_rejected() {
        let (_, pubsub) = pubsub();
        assert!(matches!(
            pubsub.publish("", "x", PublishOptions::default()).await,
            Err(PubSubError::InvalidChannel(_))
        ));
        assert!(matches!(
            pubsub.publish("/__status", "x", PublishOptions::default()).await,
            Err(PubSubError::InvalidChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let (store, pubsub) = pubsub();
        store.inject_failures(1);
        assert!(matches!(
            pubsub.publish("/c", "x", PublishOptions::default()).await,
            Err(PubSubError::Store(StoreError::Unavailable(_)))
        ));
        assert_eq!(pubsub.publish("/c", "x", PublishOptions::default()).await.unwrap(), 1);
    }
}
