//! # Herald
//!
//! Publish/subscribe channels over a shared, append-only document log. There
//! is no broker: the document store is both transport and durability layer,
//! and any number of processes can publish to and follow the same channel.
//!
//! ## Core Concepts
//!
//! - **Channel**: a named topic bound to one collection in the store
//! - **Log entry**: a persisted message (or positional marker) with a
//!   store-assigned, insertion-ordered id
//! - **Follower**: a live cursor (bounded, rotating collections) or change
//!   feed (unbounded collections) positioned after a resumption point
//! - **Fan-out**: synchronous delivery of each followed entry to the
//!   listeners registered for its event name and to `"message"` listeners
//!
//! ## Example
//!
//! ```ignore
//! use herald::{Channel, ChannelConfig, MemoryStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let channel = Channel::open(ChannelConfig::new("orders"), store).await?;
//!
//! channel.subscribe("created", |order| println!("created: {order}"))?;
//! channel.subscribe_all(|message| println!("any: {message}"))?;
//!
//! channel.publish("created", &json!({"id": 7})).await?;
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod fanout;
pub mod follower;
pub mod lifecycle;
pub mod provision;
pub mod resolve;
pub mod store;
pub mod types;

// Re-exports
pub use channel::{Channel, ChannelState};
pub use config::{
    ChannelConfig, ResumeFrom, DEFAULT_BOUNDED_SIZE, DEFAULT_CHANNEL_NAME, EXPIRE_AT_FIELD,
    EXPIRY_HORIZON,
};
pub use error::{ChannelError, Result};
pub use fanout::{Fanout, Listener, ListenerId, Subscription, WILDCARD_EVENT};
pub use follower::{FollowStrategy, FollowerEvent, FollowerHandle, FollowerState};
pub use lifecycle::{
    ChannelEvent, DropReason, LifecycleFilter, LifecycleHandle, LifecycleHub, LifecycleId,
};
pub use store::{
    ChangeEvent, ChangeFilter, ChangeStream, DocumentStore, EntryStream, MemoryStore,
    OperationType, SortOrder, TailQuery,
};
pub use types::*;
