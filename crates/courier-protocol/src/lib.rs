//! # courier-protocol
//!
//! Message type and wire encoding for the courier message bus.
//!
//! The bus stores and broadcasts every message as a single text line. This
//! crate owns that encoding so the store binding, the live subscriber and
//! any out-of-process tooling agree on it.
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Message};
//!
//! let msg = Message::new(1, 1, "/chat|lobby", r#"{"text":"hi"}"#);
//!
//! let encoded = codec::encode(&msg);
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.channel, "/chat|lobby");
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, GlobalEntry, ProtocolError};
pub use message::{GlobalId, Message, MessageId, STATUS_CHANNEL};
