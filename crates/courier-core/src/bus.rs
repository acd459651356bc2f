//! The message bus facade.
//!
//! Wires the durable log to the long-poll registry: a background global
//! subscriber feeds every live message to
//! [`ConnectionManager::notify_clients`].

use crate::connection_manager::ConnectionManager;
use crate::handlers::HandlerRegistry;
use crate::reliable_pubsub::{PubSubError, PublishOptions, ReliablePubSub};
use courier_protocol::{Message, MessageId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// One partition's bus: log, waiting clients and named handlers.
pub struct MessageBus {
    pubsub: Arc<ReliablePubSub>,
    connections: Arc<ConnectionManager>,
    handlers: Arc<HandlerRegistry>,
}

impl MessageBus {
    /// Create a bus over a pub/sub log.
    #[must_use]
    pub fn new(pubsub: Arc<ReliablePubSub>) -> Self {
        Self {
            pubsub,
            connections: Arc::new(ConnectionManager::new()),
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    /// Get the durable log.
    #[must_use]
    pub fn pubsub(&self) -> &Arc<ReliablePubSub> {
        &self.pubsub
    }

    /// Get the waiting-client registry.
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Get the named handlers.
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid or the store fails.
    pub async fn publish(
        &self,
        channel: &str,
        data: impl Into<String>,
        options: PublishOptions,
    ) -> Result<MessageId, PubSubError> {
        self.pubsub.publish(channel, data, options).await
    }

    /// Start routing live messages to waiting clients.
    ///
    /// `on_routed` is called with each message and the number of clients it
    /// was delivered to.
    pub fn spawn_fanout<F>(&self, on_routed: F) -> JoinHandle<()>
    where
        F: Fn(&Message, usize) + Send + 'static,
    {
        let pubsub = self.pubsub.clone();
        let connections = self.connections.clone();

        tokio::spawn(async move {
            pubsub
                .global_subscribe(None, move |message| {
                    let delivered = connections.notify_clients(&message);
                    on_routed(&message, delivered);
                })
                .await;
        })
    }

    /// Stop the fan-out subscriber and answer every waiting client with an
    /// empty result.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop signal cannot be published.
    pub async fn shutdown(&self) -> Result<(), PubSubError> {
        self.pubsub.global_unsubscribe().await?;
        let closed = self.connections.close_all();
        info!(site = ?self.pubsub.site_id(), closed, "Message bus shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_fanout_delivers_to_waiting_client() {
        let bus = MessageBus::new(Arc::new(ReliablePubSub::new(Arc::new(MemoryStore::new()))));
        let routed = Arc::new(AtomicUsize::new(0));
        let counter = routed.clone();
        let fanout = bus.spawn_fanout(move |_, delivered| {
            counter.fetch_add(delivered, Ordering::SeqCst);
        });

        let mut client = Client::new("c1", bus.pubsub().clone());
        client.subscribe("/chat", None).await.unwrap();
        let rx = client.attach_response();
        bus.connections().add_client(Arc::new(client));

        // Let the subscriber open its feed before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish("/chat", "hi", PublishOptions::default()).await.unwrap();

        let body = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out")
            .unwrap();
        let messages: Vec<Message> = serde_json::from_str(&body).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, "hi");

        bus.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), fanout)
            .await
            .expect("fanout did not stop")
            .unwrap();
        assert_eq!(routed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.connections().client_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_waiting_clients() {
        let bus = MessageBus::new(Arc::new(ReliablePubSub::new(Arc::new(MemoryStore::new()))));
        let client = Client::new("c1", bus.pubsub().clone());
        let rx = client.attach_response();
        bus.connections().add_client(Arc::new(client));

        bus.shutdown().await.unwrap();
        assert_eq!(rx.await.unwrap(), "[]");
    }
}
