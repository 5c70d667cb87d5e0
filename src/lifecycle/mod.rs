//! Channel lifecycle events.
//!
//! Published messages go to listeners through the fan-out registry. Everything
//! else a channel reports about itself goes through here:
//! - `ready` once a `listen` call has attached a follower, and once more
//!   (not listening) when the channel closes
//! - `collection` once the backing collection is provisioned
//! - `cursor-error`, `cursor-end`, `cursor-close` from the follower
//!
//! Subscribers get a bounded buffer; a subscriber that falls behind is dropped
//! rather than slowing the follower down.
//!
//! # Example
//!
//! ```ignore
//! let events = channel.events();
//!
//! loop {
//!     match events.recv() {
//!         Ok(ChannelEvent::CursorError { error }) => reconnect(error),
//!         Ok(ChannelEvent::Dropped { .. }) => break,
//!         Ok(_) => {}
//!         Err(_) => break,
//!     }
//! }
//! ```

mod hub;
mod types;

pub use hub::LifecycleHub;
pub use types::{ChannelEvent, DropReason, LifecycleFilter, LifecycleHandle, LifecycleId};
