//! Wire codec for bus messages.
//!
//! Each message is stored and broadcast as one line of text:
//!
//! ```text
//! {global_id}|{message_id}|{channel}|{body}
//! ```
//!
//! The channel is escaped (`%` as `%25`, `|` as `%7C`) so it never contains
//! the field separator. The body is the message data, except when the
//! message carries a user filter or the data itself starts with `#`; then
//! the body is `#{filter}#{data}`, where the filter is a comma separated id
//! list or `*` for broadcast.
//!
//! Global backlog entries use the shorter `{message_id}|{channel}` form.

use bytes::Bytes;
use std::borrow::Cow;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::message::{Message, MessageId};

/// Separator between wire fields.
pub const FIELD_SEPARATOR: char = '|';

const USER_FILTER_MARKER: char = '#';
const BROADCAST_FILTER: &str = "*";

/// Errors raised when wire data violates the encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A field separator is missing.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// An id field is not an unsigned integer.
    #[error("Invalid {field}: {value:?}")]
    InvalidId {
        /// Name of the field.
        field: &'static str,
        /// Raw field contents.
        value: String,
    },

    /// The channel contains an unknown escape sequence.
    #[error("Invalid channel escape in {0:?}")]
    InvalidEscape(String),

    /// The user filter prefix is malformed.
    #[error("Invalid user filter: {0:?}")]
    InvalidUserFilter(String),

    /// Wire data is not UTF-8.
    #[error("Message is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Escape a channel name for the wire.
#[must_use]
pub fn escape_channel(channel: &str) -> Cow<'_, str> {
    if !channel.contains(['%', FIELD_SEPARATOR]) {
        return Cow::Borrowed(channel);
    }

    let mut out = String::with_capacity(channel.len() + 8);
    for c in channel.chars() {
        match c {
            '%' => out.push_str("%25"),
            FIELD_SEPARATOR => out.push_str("%7C"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Reverse [`escape_channel`].
///
/// # Errors
///
/// Returns an error if the input holds a `%` that does not start a known
/// escape sequence.
pub fn unescape_channel(escaped: &str) -> Result<Cow<'_, str>, ProtocolError> {
    if !escaped.contains('%') {
        return Ok(Cow::Borrowed(escaped));
    }

    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
        } else if tail.starts_with("%7C") {
            out.push(FIELD_SEPARATOR);
        } else {
            return Err(ProtocolError::InvalidEscape(escaped.to_string()));
        }
        rest = &tail[3..];
    }
    out.push_str(rest);

    Ok(Cow::Owned(out))
}

/// Encode a message to its wire form.
#[must_use]
pub fn encode(message: &Message) -> String {
    let channel = escape_channel(&message.channel);
    let mut out = String::with_capacity(channel.len() + message.data.len() + 24);

    out.push_str(&message.global_id.to_string());
    out.push(FIELD_SEPARATOR);
    out.push_str(&message.message_id.to_string());
    out.push(FIELD_SEPARATOR);
    out.push_str(&channel);
    out.push(FIELD_SEPARATOR);
    encode_body(&mut out, message.user_ids.as_ref(), &message.data);

    out
}

/// Encode a message into shared bytes for the store.
#[must_use]
pub fn encode_bytes(message: &Message) -> Bytes {
    Bytes::from(encode(message))
}

fn encode_body(out: &mut String, user_ids: Option<&BTreeSet<u64>>, data: &str) {
    if user_ids.is_none() && !data.starts_with(USER_FILTER_MARKER) {
        out.push_str(data);
        return;
    }

    out.push(USER_FILTER_MARKER);
    match user_ids {
        None => out.push_str(BROADCAST_FILTER),
        Some(ids) => {
            let joined: Vec<String> = ids.iter().map(u64::to_string).collect();
            out.push_str(&joined.join(","));
        }
    }
    out.push(USER_FILTER_MARKER);
    out.push_str(data);
}

/// Decode a message from its wire form.
///
/// # Errors
///
/// Returns an error if a field is missing or malformed.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let mut fields = line.splitn(4, FIELD_SEPARATOR);

    let global_id = parse_id(fields.next(), "global_id")?;
    let message_id = parse_id(fields.next(), "message_id")?;
    let channel = fields.next().ok_or(ProtocolError::MissingField("channel"))?;
    let body = fields.next().ok_or(ProtocolError::MissingField("data"))?;

    let channel = unescape_channel(channel)?.into_owned();
    let (user_ids, data) = decode_body(body)?;

    Ok(Message {
        global_id,
        message_id,
        channel,
        data: data.to_string(),
        site_id: None,
        user_ids,
    })
}

/// Decode a message from bytes read out of the store.
///
/// # Errors
///
/// Returns an error if the bytes are not UTF-8 or not a valid message.
pub fn decode_bytes(data: &[u8]) -> Result<Message, ProtocolError> {
    decode(std::str::from_utf8(data)?)
}

fn decode_body(body: &str) -> Result<(Option<BTreeSet<u64>>, &str), ProtocolError> {
    let Some(rest) = body.strip_prefix(USER_FILTER_MARKER) else {
        return Ok((None, body));
    };

    let (filter, data) = rest
        .split_once(USER_FILTER_MARKER)
        .ok_or_else(|| ProtocolError::InvalidUserFilter(body.to_string()))?;

    if filter == BROADCAST_FILTER {
        return Ok((None, data));
    }

    let mut ids = BTreeSet::new();
    for id in filter.split(',').filter(|s| !s.is_empty()) {
        let id = id
            .parse()
            .map_err(|_| ProtocolError::InvalidUserFilter(filter.to_string()))?;
        ids.insert(id);
    }

    Ok((Some(ids), data))
}

fn parse_id(field: Option<&str>, name: &'static str) -> Result<u64, ProtocolError> {
    let raw = field.ok_or(ProtocolError::MissingField(name))?;
    raw.parse().map_err(|_| ProtocolError::InvalidId {
        field: name,
        value: raw.to_string(),
    })
}

/// One entry of the global backlog: which channel message a global id
/// refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalEntry {
    /// Message id within the channel.
    pub message_id: MessageId,
    /// Channel name, unescaped.
    pub channel: String,
}

impl GlobalEntry {
    /// Create a new global entry.
    #[must_use]
    pub fn new(message_id: MessageId, channel: impl Into<String>) -> Self {
        Self {
            message_id,
            channel: channel.into(),
        }
    }

    /// Encode as `{message_id}|{channel}`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!(
            "{}{}{}",
            self.message_id, FIELD_SEPARATOR, self.channel
        ))
    }

    /// Decode an entry. The channel may itself contain separators.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry has no separator or a bad id.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(data)?;
        let (id, channel) = line
            .split_once(FIELD_SEPARATOR)
            .ok_or(ProtocolError::MissingField("channel"))?;

        Ok(Self {
            message_id: parse_id(Some(id), "message_id")?,
            channel: channel.to_string(),
        })
    }
}
