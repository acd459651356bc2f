//! Live tail of the global log.
//!
//! A subscriber listens on the partition's notification topic and keeps a
//! cursor holding the highest global id it has handed out. A live message
//! whose id is not exactly `cursor + 1` means a notification was lost (or
//! the store hiccuped), so instead of delivering it directly the subscriber
//! replays the global backlog from the cursor, which yields the missing
//! messages and the new one in order.
//!
//! Store failures never end the loop. The subscriber logs, waits the
//! configured reconnect delay, resubscribes, and replays from its cursor.
//!
//! A reset restarts global ids at 1. The reset broadcasts a restart signal
//! that rewinds every cursor; a subscriber that missed it notices the
//! partition head fell below its cursor and rewinds as well.

use crate::reliable_pubsub::{PubSubError, ReliablePubSub};
use crate::store::Notification;
use bytes::Bytes;
use courier_protocol::{codec, GlobalId, Message, MessageId};
use tracing::{debug, error, info, trace, warn};

/// Payload that stops every subscriber on the topic.
const UNSUBSCRIBE: &[u8] = b"UNSUB";

/// Payload announcing that the partition log was reset.
pub(crate) const RESTART: &[u8] = b"RESET";

/// What to do with a live message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveAction {
    /// Next in sequence: deliver it.
    Deliver,
    /// Already delivered (replayed earlier): drop it.
    Skip,
    /// Ids were skipped: replay the backlog instead.
    Repair,
}

/// The highest global id a subscriber has delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    highest_id: Option<GlobalId>,
}

impl Cursor {
    /// Create a cursor positioned after `highest_id`.
    #[must_use]
    pub fn new(highest_id: Option<GlobalId>) -> Self {
        Self { highest_id }
    }

    /// Get the highest delivered global id.
    #[must_use]
    pub fn highest_id(&self) -> Option<GlobalId> {
        self.highest_id
    }

    /// Decide how to handle a live message with `global_id`.
    #[must_use]
    pub fn classify(&self, global_id: GlobalId) -> LiveAction {
        match self.highest_id {
            None => LiveAction::Deliver,
            Some(highest) if global_id <= highest => LiveAction::Skip,
            Some(highest) if global_id == highest + 1 => LiveAction::Deliver,
            Some(_) => LiveAction::Repair,
        }
    }

    /// Whether `global_id` is past the cursor.
    #[must_use]
    pub fn is_new(&self, global_id: GlobalId) -> bool {
        self.highest_id.map_or(true, |highest| global_id > highest)
    }

    /// Move the cursor forward. Never moves it back.
    pub fn advance(&mut self, global_id: GlobalId) {
        self.highest_id = Some(self.highest_id.map_or(global_id, |h| h.max(global_id)));
    }

    /// Rewind to the start of a restarted log.
    pub fn restart(&mut self) {
        self.highest_id = Some(0);
    }
}

impl ReliablePubSub {
    /// Follow every message published on the partition.
    ///
    /// With `last_id`, everything after that global id is replayed first.
    /// Without it, delivery starts with the first message published after
    /// the call. Runs until [`ReliablePubSub::global_unsubscribe`] is
    /// called; store failures are retried after the reconnect delay.
    pub async fn global_subscribe<F>(&self, last_id: Option<GlobalId>, mut on_message: F)
    where
        F: FnMut(Message) + Send,
    {
        let mut cursor = Cursor::new(last_id);
        info!(site = ?self.config.site_id, last_id = ?last_id, "Starting global subscriber");

        loop {
            match self.run_subscription(&mut cursor, &mut on_message).await {
                Ok(()) => {
                    info!(highest_id = ?cursor.highest_id(), "Global subscriber stopped");
                    return;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        highest_id = ?cursor.highest_id(),
                        retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                        "Global subscription failed"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Follow one channel.
    ///
    /// `last_id` is a channel message id; messages at or below it are never
    /// delivered. It is translated to a global cursor through the channel
    /// backlog when still retained, otherwise used as a lower bound (a few
    /// other-channel messages get replayed and filtered out).
    pub async fn subscribe<F>(&self, channel: &str, last_id: Option<MessageId>, mut on_message: F)
    where
        F: FnMut(Message) + Send,
    {
        let mut global_last_id = last_id;
        if let Some(id) = last_id {
            match self.get_message(channel, id).await {
                Ok(Some(message)) => global_last_id = Some(message.global_id),
                Ok(None) => {}
                Err(e) => warn!(channel = %channel, error = %e, "Could not resolve last id"),
            }
        }

        self.global_subscribe(global_last_id, move |message| {
            let after_last = last_id.map_or(true, |id| message.message_id > id);
            if message.channel == channel && after_last {
                on_message(message);
            }
        })
        .await;
    }

    /// Stop every subscriber of this partition, in every process.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn global_unsubscribe(&self) -> Result<(), PubSubError> {
        self.store
            .publish(self.keys.notifications(), Bytes::from_static(UNSUBSCRIBE))
            .await?;
        debug!(site = ?self.config.site_id, "Sent unsubscribe");
        Ok(())
    }

    /// Subscribe once and pump notifications until unsubscribed or failed.
    async fn run_subscription<F>(
        &self,
        cursor: &mut Cursor,
        on_message: &mut F,
    ) -> Result<(), PubSubError>
    where
        F: FnMut(Message) + Send,
    {
        if cursor.highest_id().is_none() {
            // Read the head before subscribing; the catch-up below covers the window.
            cursor.advance(self.global_last_id().await?);
        }

        let mut subscription = self.store.subscribe(self.keys.notifications()).await?;
        self.catch_up(cursor, on_message).await?;

        loop {
            let payload = match subscription.recv().await? {
                Notification::Payload(payload) => payload,
                Notification::Lagged(missed) => {
                    warn!(missed, "Notification feed lagged, replaying backlog");
                    self.catch_up(cursor, on_message).await?;
                    continue;
                }
            };

            if payload.as_ref() == UNSUBSCRIBE {
                return Ok(());
            }

            if payload.as_ref() == RESTART {
                info!(highest_id = ?cursor.highest_id(), "Message log reset, rewinding");
                cursor.restart();
                self.catch_up(cursor, on_message).await?;
                continue;
            }

            let message = match codec::decode_bytes(&payload) {
                Ok(message) => message.with_site_id(self.config.site_id.clone()),
                Err(e) => {
                    error!(error = %e, "Malformed notification");
                    continue;
                }
            };

            match cursor.classify(message.global_id) {
                LiveAction::Deliver => {
                    trace!(global_id = message.global_id, channel = %message.channel, "Live delivery");
                    cursor.advance(message.global_id);
                    on_message(message);
                }
                LiveAction::Skip => {
                    let head = self.global_last_id().await?;
                    if cursor.highest_id().map_or(false, |highest| head < highest) {
                        warn!(
                            highest_id = ?cursor.highest_id(),
                            head,
                            "Partition head behind cursor, log was reset"
                        );
                        cursor.restart();
                        self.catch_up(cursor, on_message).await?;
                        if cursor.is_new(message.global_id) {
                            cursor.advance(message.global_id);
                            on_message(message);
                        }
                    } else {
                        trace!(global_id = message.global_id, "Skipping replayed message");
                    }
                }
                LiveAction::Repair => {
                    warn!(
                        highest_id = ?cursor.highest_id(),
                        global_id = message.global_id,
                        "Gap in notification feed, replaying backlog"
                    );
                    self.catch_up(cursor, on_message).await?;
                    // Still ahead when its channel message was trimmed already.
                    if cursor.is_new(message.global_id) {
                        cursor.advance(message.global_id);
                        on_message(message);
                    }
                }
            }
        }
    }

    /// Deliver everything in the global backlog after the cursor.
    async fn catch_up<F>(&self, cursor: &mut Cursor, on_message: &mut F) -> Result<(), PubSubError>
    where
        F: FnMut(Message) + Send,
    {
        let Some(highest_id) = cursor.highest_id() else {
            return Ok(());
        };

        let mut replayed = 0usize;
        for message in self.global_backlog(Some(highest_id)).await? {
            if cursor.is_new(message.global_id) {
                cursor.advance(message.global_id);
                on_message(message);
                replayed += 1;
            }
        }

        if replayed > 0 {
            debug!(from = highest_id, replayed, "Replayed global backlog");
        }
        Ok(())
    }
}
