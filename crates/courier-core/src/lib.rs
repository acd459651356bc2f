//! # courier-core
//!
//! Durable, ordered, at-least-once publish/subscribe for courier.
//!
//! This crate provides the building blocks behind the long-poll server:
//!
//! - **Store** - Transactional key/value + notification abstraction, in
//!   memory or on Redis (`redis` feature)
//! - **ReliablePubSub** - Per-channel and global backlogs with trimming
//! - **Subscriber** - Live tail of the global log with gap repair
//! - **Client** - One pending long-poll request
//! - **ConnectionManager** - Routes live messages to waiting clients
//! - **HandlerRegistry** - Named request handlers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌─────────────┐
//! │  Publisher  │────▶│ ReliablePubSub │────▶│    Store    │
//! └─────────────┘     └────────────────┘     └─────────────┘
//!                             ▲                     │ notifications
//!                     backlog │                     ▼
//! ┌─────────────┐     ┌────────────────┐     ┌─────────────┐
//! │   Client    │◀────│ ConnectionMgr  │◀────│ Subscriber  │
//! └─────────────┘     └────────────────┘     └─────────────┘
//! ```

pub mod bus;
pub mod channel;
pub mod client;
pub mod connection_manager;
pub mod handlers;
pub mod reliable_pubsub;
pub mod store;
pub mod subscriber;

pub use bus::MessageBus;
pub use client::{Client, ClientError, Offer, NEVER_SEEN};
pub use connection_manager::{ChannelSubscribers, ConnectionManager, ConnectionStats};
pub use handlers::{HandlerError, HandlerRegistry};
pub use reliable_pubsub::{PubSubConfig, PubSubError, PublishOptions, ReliablePubSub};
pub use store::{MemoryStore, Store, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use subscriber::{Cursor, LiveAction};
