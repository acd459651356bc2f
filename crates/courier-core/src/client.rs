//! Long-poll clients.
//!
//! A [`Client`] lives for exactly one long-poll request. It carries the
//! channels the request wants (with the last id the caller has seen on
//! each) and a one-shot response handle. The handle is consumed at most
//! once: by the initial backlog, by a live delivery, or by [`Client::close`].
//!
//! While its backlog is being read a client is *priming*: live messages
//! offered to it are held and sent together with the backlog, so a live
//! message can never answer the request ahead of older unsent ones.

use crate::reliable_pubsub::{PubSubError, ReliablePubSub};
use courier_protocol::{GlobalId, Message, MessageId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Last-seen id meaning "never seen, just report the head".
pub const NEVER_SEEN: i64 = -1;

/// Client delivery errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Messages could not be encoded for the response.
    #[error("Failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    /// The request waiting for the response is gone.
    #[error("Response receiver dropped for client {0}")]
    ResponseClosed(String),
}

/// Outcome of offering a live message to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Sent as the response.
    Delivered,
    /// Held until the backlog goes out.
    Held,
    /// The response was already sent.
    Answered,
}

#[derive(Default)]
struct Response {
    sender: Option<oneshot::Sender<String>>,
    /// `Some` while priming.
    held: Option<Vec<Message>>,
}

/// One pending long-poll request.
pub struct Client {
    client_id: String,
    user_id: Option<u64>,
    site_id: Option<String>,
    connect_time: Instant,
    subscriptions: BTreeMap<String, i64>,
    bus: Arc<ReliablePubSub>,
    response: Mutex<Response>,
    cleanup_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a client for the partition served by `bus`.
    #[must_use]
    pub fn new(client_id: impl Into<String>, bus: Arc<ReliablePubSub>) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: None,
            site_id: bus.site_id().map(str::to_string),
            connect_time: Instant::now(),
            subscriptions: BTreeMap::new(),
            bus,
            response: Mutex::new(Response::default()),
            cleanup_timer: Mutex::new(None),
        }
    }

    /// Set the authenticated user.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<u64>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Get the client ID.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the user ID.
    #[must_use]
    pub fn user_id(&self) -> Option<u64> {
        self.user_id
    }

    /// Get the partition.
    #[must_use]
    pub fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }

    /// Time since the request arrived.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connect_time.elapsed()
    }

    /// Channels and last-seen ids.
    #[must_use]
    pub fn subscriptions(&self) -> &BTreeMap<String, i64> {
        &self.subscriptions
    }

    /// Record the last id seen on a channel.
    ///
    /// Without `last_seen_id` the client starts from the channel's current
    /// head.
    ///
    /// # Errors
    ///
    /// Returns an error if the head cannot be read.
    pub async fn subscribe(
        &mut self,
        channel: impl Into<String>,
        last_seen_id: Option<i64>,
    ) -> Result<(), PubSubError> {
        let channel = channel.into();
        let last_seen_id = match last_seen_id {
            Some(id) => id,
            None => to_seen_id(self.bus.last_id(&channel).await?),
        };
        trace!(client = %self.client_id, channel = %channel, last_seen_id, "Client subscribed");
        self.subscriptions.insert(channel, last_seen_id);
        Ok(())
    }

    /// Whether the client may see a message.
    #[must_use]
    pub fn allowed(&self, message: &Message) -> bool {
        message.is_allowed_for(self.user_id)
    }

    /// Everything the client missed, in publish order.
    ///
    /// Channels subscribed as never seen contribute no history; instead one
    /// status message reporting their head ids is appended. A channel whose
    /// last-seen id is past its head (the log was reset) is reported the
    /// same way.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn backlog(&self) -> Result<Vec<Message>, PubSubError> {
        let mut messages = Vec::new();
        let mut heads = BTreeMap::new();

        for (channel, &last_seen_id) in &self.subscriptions {
            match MessageId::try_from(last_seen_id) {
                Ok(last_id) => {
                    let backlog = self.bus.backlog(channel, Some(last_id)).await?;
                    if backlog.is_empty() {
                        let head = self.bus.last_id(channel).await?;
                        if last_id > head {
                            debug!(channel = %channel, last_id, head, "Client is ahead of channel");
                            heads.insert(channel.clone(), head);
                        }
                    }
                    messages.extend(backlog.into_iter().filter(|m| self.allowed(m)));
                }
                Err(_) => {
                    heads.insert(channel.clone(), self.bus.last_id(channel).await?);
                }
            }
        }

        messages.sort_by_key(|m| m.global_id);
        if !heads.is_empty() {
            messages.push(Message::status(&heads).with_site_id(self.site_id.clone()));
        }
        Ok(messages)
    }

    /// Bind the response of the request that owns this client.
    pub fn attach_response(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.response) = Response {
            sender: Some(tx),
            held: None,
        };
        rx
    }

    /// Whether the response has not been sent yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        lock(&self.response).sender.is_some()
    }

    /// Hold live messages until [`Client::finish_priming`] is called.
    pub fn start_priming(&self) {
        lock(&self.response).held = Some(Vec::new());
    }

    /// Hand over a live message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or the request
    /// is gone.
    pub fn offer(&self, message: &Message) -> Result<Offer, ClientError> {
        let mut response = lock(&self.response);
        if response.sender.is_none() {
            return Ok(Offer::Answered);
        }
        if let Some(held) = response.held.as_mut() {
            trace!(client = %self.client_id, global_id = message.global_id, "Holding live message");
            held.push(message.clone());
            return Ok(Offer::Held);
        }
        self.send(&mut response, std::slice::from_ref(message))?;
        Ok(Offer::Delivered)
    }

    /// Stop priming and send `backlog` together with any held live
    /// messages, in publish order and without duplicates.
    ///
    /// Returns `false` when there is nothing to send; the client then keeps
    /// waiting for live messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the messages cannot be encoded or the request
    /// is gone.
    pub fn finish_priming(&self, backlog: Vec<Message>) -> Result<bool, ClientError> {
        let mut response = lock(&self.response);
        let held = response.held.take().unwrap_or_default();

        let mut ordered: BTreeMap<GlobalId, Message> = BTreeMap::new();
        let mut status = Vec::new();
        for message in backlog.into_iter().chain(held) {
            if message.is_status() {
                status.push(message);
            } else {
                ordered.entry(message.global_id).or_insert(message);
            }
        }

        let messages: Vec<Message> = ordered.into_values().chain(status).collect();
        if messages.is_empty() {
            return Ok(false);
        }
        self.send(&mut response, &messages)
    }

    /// Complete the response with no messages if still pending.
    pub fn close(&self) -> bool {
        let Some(tx) = lock(&self.response).sender.take() else {
            return false;
        };

        self.cancel_cleanup_timer();
        // The request may already be gone; nothing is owed to it then.
        let _ = tx.send("[]".to_string());
        debug!(client = %self.client_id, age_ms = self.age().as_millis() as u64, "Closed");
        true
    }

    /// Own the task that closes this client on timeout.
    pub fn set_cleanup_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = lock(&self.cleanup_timer).replace(timer) {
            previous.abort();
        }
    }

    /// Abort the timeout task, if any.
    pub fn cancel_cleanup_timer(&self) {
        if let Some(timer) = lock(&self.cleanup_timer).take() {
            timer.abort();
        }
    }
}

impl Client {
    fn send(&self, response: &mut Response, messages: &[Message]) -> Result<bool, ClientError> {
        let body = serde_json::to_string(messages)?;
        let Some(tx) = response.sender.take() else {
            return Ok(false);
        };
        response.held = None;

        self.cancel_cleanup_timer();
        tx.send(body)
            .map_err(|_| ClientError::ResponseClosed(self.client_id.clone()))?;
        debug!(
            client = %self.client_id,
            messages = messages.len(),
            age_ms = self.age().as_millis() as u64,
            "Delivered"
        );
        Ok(true)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.client_id)
            .field("user_id", &self.user_id)
            .field("site_id", &self.site_id)
            .field("subscriptions", &self.subscriptions)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

fn to_seen_id(id: MessageId) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
