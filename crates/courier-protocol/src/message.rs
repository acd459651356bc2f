//! Message type for the courier bus.
//!
//! A [`Message`] is created once at publish time and never mutated after it
//! has been encoded. Messages are ordered per channel by `message_id`; the
//! `global_id` orders them across every channel of one partition.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A per-channel message identifier.
pub type MessageId = u64;

/// A partition-wide message identifier.
pub type GlobalId = u64;

/// Reserved channel for server-generated status messages.
///
/// Never published to directly; see [`Message::status`].
pub const STATUS_CHANNEL: &str = "/__status";

/// A message on the bus.
///
/// Serializes to the JSON object handed to long-poll clients:
/// `{"global_id":..,"message_id":..,"channel":..,"data":..}`. The partition
/// and delivery filter are routing metadata and are not exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Strictly increasing across all channels of a partition.
    pub global_id: GlobalId,
    /// Strictly increasing within one channel, starting at 1.
    pub message_id: MessageId,
    /// Channel the message was published to.
    pub channel: String,
    /// Opaque payload, usually pre-serialized JSON.
    pub data: String,
    /// Partition key of the bus that stored the message.
    #[serde(skip)]
    pub site_id: Option<String>,
    /// Delivery allow-list. `None` broadcasts to every subscriber.
    #[serde(skip)]
    pub user_ids: Option<BTreeSet<u64>>,
}

impl Message {
    /// Create a new broadcast message.
    #[must_use]
    pub fn new(
        global_id: GlobalId,
        message_id: MessageId,
        channel: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            global_id,
            message_id,
            channel: channel.into(),
            data: data.into(),
            site_id: None,
            user_ids: None,
        }
    }

    /// Attach the partition key.
    #[must_use]
    pub fn with_site_id(mut self, site_id: Option<String>) -> Self {
        self.site_id = site_id;
        self
    }

    /// Restrict delivery to the given users.
    #[must_use]
    pub fn with_user_ids(mut self, user_ids: impl IntoIterator<Item = u64>) -> Self {
        self.user_ids = Some(user_ids.into_iter().collect());
        self
    }

    /// Build the synthetic status message reporting the head id of each
    /// channel a client subscribed to "from now".
    #[must_use]
    pub fn status(last_ids: &BTreeMap<String, MessageId>) -> Self {
        let payload: Map<String, Value> = last_ids
            .iter()
            .map(|(channel, id)| (channel.clone(), Value::from(*id)))
            .collect();
        Self::new(0, 0, STATUS_CHANNEL, Value::Object(payload).to_string())
    }

    /// Whether this is a server-generated status message.
    #[must_use]
    pub fn is_status(&self) -> bool {
        self.channel == STATUS_CHANNEL
    }

    /// Whether a user may receive this message.
    ///
    /// Anonymous users only receive broadcast messages.
    #[must_use]
    pub fn is_allowed_for(&self, user_id: Option<u64>) -> bool {
        match (&self.user_ids, user_id) {
            (None, _) => true,
            (Some(allowed), Some(user)) => allowed.contains(&user),
            (Some(_), None) => false,
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(7, 3, "/chat", "hello");
        assert_eq!(msg.global_id, 7);
        assert_eq!(msg.message_id, 3);
        assert_eq!(msg.channel, "/chat");
        assert_eq!(msg.payload_size(), 5);
        assert!(msg.user_ids.is_none());
        assert!(msg.site_id.is_none());
    }

    #[test]
    fn test_user_filter() {
        let broadcast = Message::new(1, 1, "/a", "x");
        assert!(broadcast.is_allowed_for(None));
        assert!(broadcast.is_allowed_for(Some(42)));

        let filtered = Message::new(1, 1, "/a", "x").with_user_ids([1, 2]);
        assert!(filtered.is_allowed_for(Some(1)));
        assert!(!filtered.is_allowed_for(Some(3)));
        assert!(!filtered.is_allowed_for(None));

        let nobody = Message::new(1, 1, "/a", "x").with_user_ids([]);
        assert!(!nobody.is_allowed_for(Some(1)));
    }

    #[test]
    fn test_status_message() {
        let mut last_ids = BTreeMap::new();
        last_ids.insert("/a".to_string(), 4);
        last_ids.insert("/b".to_string(), 0);

        let status = Message::status(&last_ids);
        assert!(status.is_status());
        assert_eq!(status.global_id, 0);

        let data: Value = serde_json::from_str(&status.data).unwrap();
        assert_eq!(data["/a"], 4);
        assert_eq!(data["/b"], 0);
    }

    #[test]
    fn test_client_json_hides_routing_fields() {
        let msg = Message::new(5, 2, "/a", "{}")
            .with_site_id(Some("forum".into()))
            .with_user_ids([9]);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["global_id"], 5);
        assert_eq!(json["message_id"], 2);
        assert_eq!(json["channel"], "/a");
        assert!(json.get("site_id").is_none());
        assert!(json.get("user_ids").is_none());
    }
}
