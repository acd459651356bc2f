//! Channel names and the store key namespace.
//!
//! Every partition (site) owns a disjoint set of store keys:
//!
//! ```text
//! courier:[site=<site>:]backlog:<channel>   channel backlog list
//! courier:[site=<site>:]offset:<channel>    channel offset counter
//! courier:[site=<site>:]global_id           global id counter
//! courier:[site=<site>:]global_backlog      global backlog list
//! courier:[site=<site>:]global_offset       global offset counter
//! courier:[site=<site>:]notifications       notification topic
//! ```
//!
//! `%` and `:` in a site id are percent-encoded, so one site's prefix is
//! never a prefix of another site's keys.

use courier_protocol::STATUS_CHANNEL;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 1024;

/// Root of every key written by the bus.
const KEY_ROOT: &str = "courier:";

/// Validate a channel name for publishing.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name == STATUS_CHANNEL {
        return Err("The status channel is reserved");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains control characters");
    }
    Ok(())
}

/// Store keys for one partition.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    global_id: String,
    global_backlog: String,
    global_offset: String,
    notifications: String,
}

impl KeySpace {
    /// Create the key space for a partition.
    #[must_use]
    pub fn new(site_id: Option<&str>) -> Self {
        let prefix = match site_id {
            Some(site) => format!("{KEY_ROOT}site={}:", escape_site(site)),
            None => KEY_ROOT.to_string(),
        };

        Self {
            global_id: format!("{prefix}global_id"),
            global_backlog: format!("{prefix}global_backlog"),
            global_offset: format!("{prefix}global_offset"),
            notifications: format!("{prefix}notifications"),
            prefix,
        }
    }

    /// Backlog list of a channel.
    #[must_use]
    pub fn backlog(&self, channel: &str) -> String {
        format!("{}backlog:{channel}", self.prefix)
    }

    /// Offset counter of a channel.
    #[must_use]
    pub fn offset(&self, channel: &str) -> String {
        format!("{}offset:{channel}", self.prefix)
    }

    /// Global id counter.
    #[must_use]
    pub fn global_id(&self) -> &str {
        &self.global_id
    }

    /// Global backlog list.
    #[must_use]
    pub fn global_backlog(&self) -> &str {
        &self.global_backlog
    }

    /// Global offset counter.
    #[must_use]
    pub fn global_offset(&self) -> &str {
        &self.global_offset
    }

    /// Notification topic.
    #[must_use]
    pub fn notifications(&self) -> &str {
        &self.notifications
    }

    /// Key prefixes covering everything this partition stores.
    #[must_use]
    pub fn owned_prefixes(&self) -> [String; 3] {
        [
            format!("{}backlog:", self.prefix),
            format!("{}offset:", self.prefix),
            format!("{}global", self.prefix),
        ]
    }
}

fn escape_site(site: &str) -> String {
    site.replace('%', "%25").replace(':', "%3A")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("/chat/room|1").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name(STATUS_CHANNEL).is_err());
        assert!(validate_channel_name("/bad\nname").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_default_key_space() {
        let keys = KeySpace::new(None);
        assert_eq!(keys.backlog("/a"), "courier:backlog:/a");
        assert_eq!(keys.offset("/a"), "courier:offset:/a");
        assert_eq!(keys.global_id(), "courier:global_id");
        assert_eq!(keys.notifications(), "courier:notifications");
    }

    #[test]
    fn test_site_keys_are_disjoint() {
        let default = KeySpace::new(None);
        let site = KeySpace::new(Some("backlog"));

        assert_eq!(site.backlog("/a"), "courier:site=backlog:backlog:/a");
        assert_ne!(site.backlog("/a"), default.backlog("backlog:/a"));
        for prefix in default.owned_prefixes() {
            assert!(!site.backlog("/a").starts_with(&prefix));
            assert!(!site.global_id().starts_with(&prefix));
        }
    }

    #[test]
    fn test_site_separator_is_escaped() {
        let short = KeySpace::new(Some("x"));
        let nested = KeySpace::new(Some("x:backlog:y"));

        assert_eq!(nested.backlog("/a"), "courier:site=x%3Abacklog%3Ay:backlog:/a");
        for prefix in short.owned_prefixes() {
            assert!(!nested.backlog("/a").starts_with(&prefix));
            assert!(!nested.offset("/a").starts_with(&prefix));
            assert!(!nested.global_id().starts_with(&prefix));
        }

        // Already-encoded text stays distinct from the raw separator.
        assert_ne!(
            KeySpace::new(Some("a%3Ab")).global_id(),
            KeySpace::new(Some("a:b")).global_id()
        );
    }
}
