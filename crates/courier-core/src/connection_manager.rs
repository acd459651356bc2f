//! In-process registry of waiting long-poll clients.
//!
//! The manager indexes clients by id and by `(site, channel)` so a message
//! coming off the global subscriber can be routed to exactly the requests
//! waiting on its channel. Long-poll clients are one-shot: a client fed a
//! message is dropped from the registry at once, and the caller polls
//! again.

use crate::client::{Client, Offer};
use courier_protocol::Message;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

type SiteKey = Option<String>;

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Arc<Client>>,
    subscriptions: HashMap<SiteKey, HashMap<String, HashSet<String>>>,
}

impl Registry {
    fn insert(&mut self, client: Arc<Client>) -> Option<Arc<Client>> {
        let previous = self.remove(client.client_id());

        let site = client.site_id().map(str::to_string);
        let channels = self.subscriptions.entry(site).or_default();
        for channel in client.subscriptions().keys() {
            channels
                .entry(channel.clone())
                .or_default()
                .insert(client.client_id().to_string());
        }
        self.clients.insert(client.client_id().to_string(), client);

        previous
    }

    fn remove(&mut self, client_id: &str) -> Option<Arc<Client>> {
        let client = self.clients.remove(client_id)?;

        let site = client.site_id().map(str::to_string);
        if let Some(channels) = self.subscriptions.get_mut(&site) {
            for channel in client.subscriptions().keys() {
                if let Some(ids) = channels.get_mut(channel) {
                    ids.remove(client_id);
                    if ids.is_empty() {
                        channels.remove(channel);
                    }
                }
            }
            if channels.is_empty() {
                self.subscriptions.remove(&site);
            }
        }

        client.cancel_cleanup_timer();
        Some(client)
    }

    fn subscribers(&self, site: &SiteKey, channel: &str) -> Vec<Arc<Client>> {
        self.subscriptions
            .get(site)
            .and_then(|channels| channels.get(channel))
            .map(|ids| ids.iter().filter_map(|id| self.clients.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// Subscribers of one channel.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelSubscribers {
    /// Partition.
    pub site_id: Option<String>,
    /// Channel name.
    pub channel: String,
    /// Waiting client ids, sorted.
    pub client_ids: Vec<String>,
}

/// Connection manager statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Number of waiting clients.
    pub client_count: usize,
    /// Every indexed channel with its waiting clients.
    pub subscriptions: Vec<ChannelSubscribers>,
}

/// Routes live messages to waiting long-poll clients.
#[derive(Default)]
pub struct ConnectionManager {
    registry: Mutex<Registry>,
}

impl ConnectionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under each of its channels.
    ///
    /// A client already registered with the same id is closed and replaced.
    pub fn add_client(&self, client: Arc<Client>) {
        let client_id = client.client_id().to_string();
        let channels = client.subscriptions().len();
        let previous = self.lock().insert(client);

        if let Some(previous) = previous {
            debug!(client = %client_id, "Replacing client with the same id");
            previous.close();
        }
        debug!(client = %client_id, channels, "Client added");
    }

    /// Unregister a client.
    ///
    /// Only removes the exact instance given, so a stale request cannot
    /// evict a newer client that reused its id. Returns whether it was
    /// registered.
    pub fn remove_client(&self, client: &Arc<Client>) -> bool {
        let mut registry = self.lock();
        let registered = registry
            .clients
            .get(client.client_id())
            .is_some_and(|current| Arc::ptr_eq(current, client));

        if registered {
            registry.remove(client.client_id());
            debug!(client = %client.client_id(), "Client removed");
        }
        registered
    }

    /// Deliver a message to every client waiting on its channel.
    ///
    /// Clients whose user is not allowed to see the message are left
    /// waiting, and so are priming clients, which hold the message until
    /// their backlog goes out. Every other client that was fed the message
    /// (or failed while being fed) is removed. Returns the number of
    /// successful deliveries.
    pub fn notify_clients(&self, message: &Message) -> usize {
        let mut registry = self.lock();
        let subscribers = registry.subscribers(&message.site_id, &message.channel);
        if subscribers.is_empty() {
            trace!(channel = %message.channel, "No waiting clients");
            return 0;
        }

        let mut delivered = 0;
        for client in subscribers {
            if !client.allowed(message) {
                continue;
            }

            match client.offer(message) {
                Ok(Offer::Delivered) => delivered += 1,
                Ok(Offer::Held) => continue,
                Ok(Offer::Answered) => trace!(client = %client.client_id(), "Client already answered"),
                Err(e) => warn!(
                    client = %client.client_id(),
                    channel = %message.channel,
                    error = %e,
                    "Failed to notify client"
                ),
            }
            registry.remove(client.client_id());
        }

        trace!(
            channel = %message.channel,
            message_id = message.message_id,
            bytes = message.payload_size(),
            delivered,
            "Notified clients"
        );
        delivered
    }

    /// Look up a waiting client.
    #[must_use]
    pub fn lookup_client(&self, client_id: &str) -> Option<Arc<Client>> {
        self.lock().clients.get(client_id).cloned()
    }

    /// Get the number of waiting clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Get manager statistics.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        let registry = self.lock();

        let mut subscriptions: Vec<_> = registry
            .subscriptions
            .iter()
            .flat_map(|(site, channels)| {
                channels.iter().map(move |(channel, ids)| ChannelSubscribers {
                    site_id: site.clone(),
                    channel: channel.clone(),
                    client_ids: ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect(),
                })
            })
            .collect();
        subscriptions.sort_by(|a, b| (&a.site_id, &a.channel).cmp(&(&b.site_id, &b.channel)));

        ConnectionStats {
            client_count: registry.clients.len(),
            subscriptions,
        }
    }

    /// Close and unregister every waiting client.
    ///
    /// Returns the number of clients closed.
    pub fn close_all(&self) -> usize {
        let clients: Vec<_> = {
            let mut registry = self.lock();
            registry.subscriptions.clear();
            registry.clients.drain().map(|(_, client)| client).collect()
        };

        let closed = clients.iter().filter(|client| client.close()).count();
        info!(clients = clients.len(), closed, "Closed all clients");
        closed
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliable_pubsub::{PubSubConfig, PublishOptions, ReliablePubSub};
    use crate::store::MemoryStore;
    use tokio::sync::oneshot;

    fn bus(site_id: Option<&str>) -> Arc<ReliablePubSub> {
        let config = PubSubConfig {
            site_id: site_id.map(str::to_string),
            ..PubSubConfig::default()
        };
        Arc::new(ReliablePubSub::with_config(Arc::new(MemoryStore::new()), config))
    }

    async fn waiting_client(
        bus: &Arc<ReliablePubSub>,
        client_id: &str,
        user_id: Option<u64>,
        channels: &[&str],
    ) -> (Arc<Client>, oneshot::Receiver<String>) {
        let mut client = Client::new(client_id, bus.clone()).with_user_id(user_id);
        for channel in channels {
            client.subscribe(*channel, Some(0)).await.unwrap();
        }
        let rx = client.attach_response();
        (Arc::new(client), rx)
    }

    fn message(site: Option<&str>, channel: &str) -> Message {
        Message::new(1, 1, channel, "payload").with_site_id(site.map(str::to_string))
    }

    #[tokio::test]
    async fn test_add_and_remove_client() {
        let manager = ConnectionManager::new();
        let bus = bus(None);
        let (client, _rx) = waiting_client(&bus, "c1", None, &["/a", "/b"]).await;

        manager.add_client(client.clone());
        assert_eq!(manager.client_count(), 1);
        assert!(manager.lookup_client("c1").is_some());
        assert_eq!(manager.stats().subscriptions.len(), 2);

        assert!(manager.remove_client(&client));
        assert!(!manager.remove_client(&client));
        assert!(manager.lookup_client("c1").is_none());
        assert!(manager.stats().subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_notify_delivers_and_removes_subscribers() {
        let manager = ConnectionManager::new();
        let bus = bus(None);
        let (first, mut first_rx) = waiting_client(&bus, "c1", None, &["/a"]).await;
        let (second, mut second_rx) = waiting_client(&bus, "c2", None, &["/a"]).await;
        let (other, mut other_rx) = waiting_client(&bus, "c3", None, &["/b"]).await;
        manager.add_client(first);
        manager.add_client(second);
        manager.add_client(other);

        assert_eq!(manager.notify_clients(&message(None, "/a")), 2);
        assert!(first_rx.try_recv().unwrap().contains("payload"));
        assert!(second_rx.try_recv().unwrap().contains("payload"));
        assert!(other_rx.try_recv().is_err());

        assert_eq!(manager.client_count(), 1);
        assert!(manager.lookup_client("c3").is_some());
        assert_eq!(manager.notify_clients(&message(None, "/a")), 0);
    }

    #[tokio::test]
    async fn test_notify_respects_user_filter() {
        let manager = ConnectionManager::new();
        let bus = bus(None);
        let (allowed, mut allowed_rx) = waiting_client(&bus, "c1", Some(1), &["/a"]).await;
        let (denied, mut denied_rx) = waiting_client(&bus, "c2", Some(2), &["/a"]).await;
        manager.add_client(allowed);
        manager.add_client(denied);

        let private = message(None, "/a").with_user_ids([1]);
        assert_eq!(manager.notify_clients(&private), 1);
        assert!(allowed_rx.try_recv().is_ok());
        assert!(denied_rx.try_recv().is_err());
        assert!(manager.lookup_client("c2").is_some());
        assert!(manager.lookup_client("c1").is_none());
    }

    #[tokio::test]
    async fn test_notify_is_scoped_to_site() {
        let manager = ConnectionManager::new();
        let forum = bus(Some("forum"));
        let (client, mut rx) = waiting_client(&forum, "c1", None, &["/a"]).await;
        manager.add_client(client);

        assert_eq!(manager.notify_clients(&message(None, "/a")), 0);
        assert_eq!(manager.notify_clients(&message(Some("blog"), "/a")), 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(manager.notify_clients(&message(Some("forum"), "/a")), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_live_message_waits_for_unsent_backlog() {
        let manager = ConnectionManager::new();
        let bus = bus(None);
        for i in 1..=3 {
            bus.publish("/a", format!("m{i}"), PublishOptions::default()).await.unwrap();
        }

        let (client, rx) = waiting_client(&bus, "c1", None, &["/a"]).await;
        client.start_priming();
        manager.add_client(client.clone());

        // m4 goes live while the request is still reading its backlog.
        let backlog = client.backlog().await.unwrap();
        bus.publish("/a", "m4", PublishOptions::default()).await.unwrap();
        let live = bus.get_message("/a", 4).await.unwrap().unwrap();
        assert_eq!(manager.notify_clients(&live), 0);
        assert!(manager.lookup_client("c1").is_some());

        assert!(client.finish_priming(backlog).unwrap());
        let body: Vec<Message> = serde_json::from_str(&rx.await.unwrap()).unwrap();
        let ids: Vec<_> = body.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        assert_eq!(manager.notify_clients(&live), 0);
        assert_eq!(manager.client_count(), 0);
    }

    #[tokio::test]
    async fn test_broken_client_does_not_block_others() {
        let manager = ConnectionManager::new();
        let bus = bus(None);
        let (broken, broken_rx) = waiting_client(&bus, "c1", None, &["/a"]).await;
        let (healthy, mut healthy_rx) = waiting_client(&bus, "c2", None, &["/a"]).await;
        manager.add_client(broken);
        manager.add_client(healthy);
        drop(broken_rx);

        assert_eq!(manager.notify_clients(&message(None, "/a")), 1);
        assert!(healthy_rx.try_recv().is_ok());
        assert_eq!(manager.client_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_replaces_and_closes() {
        let manager = ConnectionManager::new();
        let bus = bus(None);
        let (old, mut old_rx) = waiting_client(&bus, "c1", None, &["/a"]).await;
        let (new, _new_rx) = waiting_client(&bus, "c1", None, &["/b"]).await;

        manager.add_client(old.clone());
        manager.add_client(new.clone());
        assert_eq!(old_rx.try_recv().unwrap(), "[]");
        assert_eq!(manager.client_count(), 1);

        // The stale request cannot evict its replacement.
        assert!(!manager.remove_client(&old));
        assert!(manager.lookup_client("c1").is_some());

        let stats = manager.stats();
        assert_eq!(stats.subscriptions.len(), 1);
        assert_eq!(stats.subscriptions[0].channel, "/b");
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = ConnectionManager::new();
        let bus = bus(None);
        let (first, mut first_rx) = waiting_client(&bus, "c1", None, &["/a"]).await;
        let (second, mut second_rx) = waiting_client(&bus, "c2", None, &["/b"]).await;
        manager.add_client(first);
        manager.add_client(second);

        assert_eq!(manager.close_all(), 2);
        assert_eq!(first_rx.try_recv().unwrap(), "[]");
        assert_eq!(second_rx.try_recv().unwrap(), "[]");
        assert_eq!(manager.client_count(), 0);
        assert!(manager.stats().subscriptions.is_empty());
    }
}
