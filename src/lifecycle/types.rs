//! Lifecycle event types.

use crate::error::ChannelError;
use crate::types::CollectionInfo;
use std::sync::Arc;

/// Channel-level events, separate from published messages.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// `listening: true` when a `listen` call attached a follower,
    /// `listening: false` when the channel closed.
    Ready { listening: bool },

    /// The backing collection was provisioned.
    Collection { collection: CollectionInfo },

    /// The follower failed. It does not reconnect by itself.
    CursorError { error: Arc<ChannelError> },

    /// The follower's stream ran out.
    CursorEnd,

    /// The follower released its cursor or feed.
    CursorClose,

    /// This lifecycle subscription was dropped.
    Dropped { reason: DropReason },
}

impl ChannelEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Ready { .. } => "ready",
            ChannelEvent::Collection { .. } => "collection",
            ChannelEvent::CursorError { .. } => "cursor-error",
            ChannelEvent::CursorEnd => "cursor-end",
            ChannelEvent::CursorClose => "cursor-close",
            ChannelEvent::Dropped { .. } => "dropped",
        }
    }
}

/// Why a lifecycle subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The channel was closed.
    ChannelClosed,
}

/// Which lifecycle events a subscriber wants.
#[derive(Clone, Debug, Default)]
pub struct LifecycleFilter {
    /// Event names to deliver (None = all).
    pub names: Option<Vec<String>>,
}

impl LifecycleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Only `cursor-error`, `cursor-end` and `cursor-close`.
    pub fn cursor() -> Self {
        Self {
            names: Some(
                ["cursor-error", "cursor-end", "cursor-close"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        }
    }

    pub fn only(names: &[&str]) -> Self {
        Self {
            names: Some(names.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub(crate) fn matches(&self, event: &ChannelEvent) -> bool {
        // Drop notices always get through.
        if matches!(event, ChannelEvent::Dropped { .. }) {
            return true;
        }
        match &self.names {
            Some(names) => names.iter().any(|n| n == event.name()),
            None => true,
        }
    }
}

/// Unique identifier for a lifecycle subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LifecycleId(pub u64);

/// Receiving end of a lifecycle subscription.
pub struct LifecycleHandle {
    pub id: LifecycleId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<ChannelEvent>,
}

impl LifecycleHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ChannelEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ChannelEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ChannelEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything buffered right now, without blocking.
    pub fn drain(&self) -> Vec<ChannelEvent> {
        self.receiver.try_iter().collect()
    }
}
