//! Redis store.
//!
//! Counters are plain string keys and lists are Redis lists. Every data key
//! `K` has a version counter at `K` + [`VERSION_SUFFIX`] that each write
//! increments. A snapshot records those versions, and a commit is a single
//! server-side script that compares them and, only if all still match,
//! applies the writes and publishes the notifications. Scripts run
//! atomically, so no other client can interleave between check and write.
//!
//! Notifications use Redis pub/sub. Each subscription owns a dedicated
//! pub/sub connection whose messages are forwarded into a broadcast channel.

use super::{Snapshot, Store, StoreError, Subscription, WriteOp};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Appended to a data key to form its version key. Channel names cannot
/// contain control characters, so no data key ends with it.
pub const VERSION_SUFFIX: &str = "\u{1}v";

/// Keys fetched per `SCAN` round while clearing.
const SCAN_BATCH: usize = 500;

/// KEYS: counters then lists. ARGV: version suffix, number of counters.
/// Returns `[value, version]` pairs in key order.
const WATCH_SCRIPT: &str = r"
local result = {}
local counters = tonumber(ARGV[2])
for i, key in ipairs(KEYS) do
  if i <= counters then
    result[#result + 1] = tonumber(redis.call('GET', key) or '0')
  else
    result[#result + 1] = redis.call('LLEN', key)
  end
  result[#result + 1] = tonumber(redis.call('GET', key .. ARGV[1]) or '0')
end
return result
";

/// KEYS: watched keys. ARGV: version suffix, one expected version per
/// key, then `kind, key, value` triples. Returns 1 if applied, 0 on
/// conflict.
const COMMIT_SCRIPT: &str = r"
local suffix = ARGV[1]
for i, key in ipairs(KEYS) do
  if tonumber(redis.call('GET', key .. suffix) or '0') ~= tonumber(ARGV[i + 1]) then
    return 0
  end
end
local i = #KEYS + 2
while i <= #ARGV do
  local kind, key, value = ARGV[i], ARGV[i + 1], ARGV[i + 2]
  if kind == 'set' then
    redis.call('SET', key, value)
    redis.call('INCR', key .. suffix)
  elseif kind == 'push' then
    redis.call('RPUSH', key, value)
    redis.call('INCR', key .. suffix)
  elseif kind == 'trim' then
    redis.call('LTRIM', key, tonumber(value), -1)
    redis.call('INCR', key .. suffix)
  elseif kind == 'publish' then
    redis.call('PUBLISH', key, value)
  end
  i = i + 3
end
return 1
";

/// KEYS: data keys to delete. ARGV: version suffix.
const CLEAR_SCRIPT: &str = r"
for _, key in ipairs(KEYS) do
  redis.call('DEL', key)
  redis.call('INCR', key .. ARGV[1])
end
return #KEYS
";

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            Self::Unavailable(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Redis implementation of [`Store`].
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    notification_capacity: usize,
    watch_script: Script,
    commit_script: Script,
    clear_script: Script,
}

impl RedisStore {
    /// Connect to Redis at `url`.
    ///
    /// `notification_capacity` bounds how far a subscriber may fall behind
    /// before it sees [`Notification::Lagged`](super::Notification::Lagged).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis cannot be reached.
    pub async fn connect(url: &str, notification_capacity: usize) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(url = %url, "Connected to redis");

        Ok(Self {
            client,
            conn,
            notification_capacity: notification_capacity.max(1),
            watch_script: Script::new(WATCH_SCRIPT),
            commit_script: Script::new(COMMIT_SCRIPT),
            clear_script: Script::new(CLEAR_SCRIPT),
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("notification_capacity", &self.notification_capacity)
            .finish_non_exhaustive()
    }
}

/// Flatten a commit into script keys and arguments.
fn commit_args(snapshot: &Snapshot, ops: &[WriteOp]) -> (Vec<String>, Vec<Vec<u8>>) {
    let mut keys = Vec::with_capacity(snapshot.versions.len());
    let mut args = Vec::with_capacity(1 + snapshot.versions.len() + ops.len() * 3);
    args.push(VERSION_SUFFIX.as_bytes().to_vec());

    for (key, version) in &snapshot.versions {
        keys.push(key.clone());
        args.push(version.to_string().into_bytes());
    }

    for op in ops {
        let (kind, key, value): (&str, &str, Vec<u8>) = match op {
            WriteOp::SetCounter { key, value } => ("set", key, value.to_string().into_bytes()),
            WriteOp::Push { key, value } => ("push", key, value.to_vec()),
            WriteOp::TrimFront { key, count } => ("trim", key, count.to_string().into_bytes()),
            WriteOp::Publish { topic, payload } => ("publish", topic, payload.to_vec()),
        };
        args.push(kind.as_bytes().to_vec());
        args.push(key.as_bytes().to_vec());
        args.push(value);
    }

    (keys, args)
}

/// `SCAN MATCH` pattern for every key starting with `prefix`.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl Store for RedisStore {
    async fn watch(&self, counters: &[&str], lists: &[&str]) -> Result<Snapshot, StoreError> {
        let mut invocation = self.watch_script.prepare_invoke();
        for key in counters.iter().chain(lists) {
            invocation.key(*key);
        }
        invocation.arg(VERSION_SUFFIX).arg(counters.len());

        let values: Vec<u64> = invocation.invoke_async(&mut self.conn.clone()).await?;
        if values.len() != (counters.len() + lists.len()) * 2 {
            return Err(StoreError::Other(format!(
                "watch returned {} values for {} keys",
                values.len(),
                counters.len() + lists.len()
            )));
        }

        let mut snapshot = Snapshot::default();
        let mut pairs = values.chunks_exact(2);
        for key in counters {
            if let Some(&[value, version]) = pairs.next() {
                snapshot.counters.insert((*key).to_string(), value);
                snapshot.versions.insert((*key).to_string(), version);
            }
        }
        for key in lists {
            if let Some(&[len, version]) = pairs.next() {
                let len = usize::try_from(len).unwrap_or(usize::MAX);
                snapshot.lengths.insert((*key).to_string(), len);
                snapshot.versions.insert((*key).to_string(), version);
            }
        }

        Ok(snapshot)
    }

    async fn commit(&self, snapshot: &Snapshot, ops: Vec<WriteOp>) -> Result<bool, StoreError> {
        let (keys, args) = commit_args(snapshot, &ops);

        let mut invocation = self.commit_script.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        for arg in &args {
            invocation.arg(arg.as_slice());
        }

        let applied: i64 = invocation.invoke_async(&mut self.conn.clone()).await?;
        if applied == 0 {
            trace!(keys = keys.len(), "Commit conflicted");
        }
        Ok(applied == 1)
    }

    async fn range(&self, list: &str, start: usize, end: usize) -> Result<Vec<Bytes>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }

        let entries: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(list)
            .arg(start)
            .arg(end - 1)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(entries.into_iter().map(Bytes::from).collect())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), StoreError> {
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload.as_ref())
            .query_async(&mut self.conn.clone())
            .await?;
        trace!(topic = %topic, receivers, "Published notification");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let (tx, rx) = broadcast::channel(self.notification_capacity);
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(message) = messages.next().await {
                let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                if tx.send(payload).is_err() {
                    // Subscription dropped.
                    break;
                }
            }
            debug!(topic = %topic, "Notification feed closed");
        });

        Ok(Subscription::new(rx))
    }

    async fn clear(&self, prefix: &str) -> Result<(), StoreError> {
        let pattern = prefix_pattern(prefix);
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut cleared = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            let data_keys: Vec<_> = keys
                .into_iter()
                .filter(|key| !key.ends_with(VERSION_SUFFIX))
                .collect();
            if !data_keys.is_empty() {
                let mut invocation = self.clear_script.prepare_invoke();
                for key in &data_keys {
                    invocation.key(key);
                }
                invocation.arg(VERSION_SUFFIX);
                let deleted: usize = invocation.invoke_async(&mut conn).await?;
                cleared += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, keys = cleared, "Cleared keys");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
