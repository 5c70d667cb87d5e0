//! Hub broadcasting lifecycle events to subscribers.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::types::{ChannelEvent, DropReason, LifecycleFilter, LifecycleHandle, LifecycleId};

struct Subscriber {
    filter: LifecycleFilter,
    sender: Sender<ChannelEvent>,
}

impl Subscriber {
    /// False once the subscriber is full or gone.
    fn try_send(&self, event: ChannelEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Fans lifecycle events out to bounded per-subscriber buffers.
pub struct LifecycleHub {
    subscribers: RwLock<HashMap<LifecycleId, Subscriber>>,
    next_id: AtomicU64,
    /// Per-subscriber buffer capacity.
    buffer_size: usize,
}

impl LifecycleHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Subscribe to every lifecycle event.
    pub fn subscribe(&self) -> LifecycleHandle {
        self.subscribe_filtered(LifecycleFilter::all())
    }

    /// Subscribe to the events matching `filter`.
    pub fn subscribe_filtered(&self, filter: LifecycleFilter) -> LifecycleHandle {
        let id = LifecycleId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);

        self.subscribers
            .write()
            .insert(id, Subscriber { filter, sender });

        LifecycleHandle { id, receiver }
    }

    /// Remove a subscriber, leaving it a final `Dropped` notice.
    pub fn unsubscribe(&self, id: LifecycleId) {
        let mut subs = self.subscribers.write();
        if let Some(sub) = subs.remove(&id) {
            let _ = sub.sender.try_send(ChannelEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Send an event to every matching subscriber.
    ///
    /// Called from the follower task, so it never blocks: a subscriber whose
    /// buffer is full is dropped instead.
    pub fn emit(&self, event: ChannelEvent) {
        let mut to_remove = Vec::new();

        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                if sub.filter.matches(&event) && !sub.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscribers.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscriber = id.0, "dropping slow lifecycle subscriber");
                    let _ = sub.sender.try_send(ChannelEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }

    /// Remove every subscriber, telling each the channel closed.
    pub fn close_all(&self) {
        let drained: Vec<Subscriber> = self.subscribers.write().drain().map(|(_, s)| s).collect();
        for sub in drained {
            let _ = sub.sender.try_send(ChannelEvent::Dropped {
                reason: DropReason::ChannelClosed,
            });
        }
    }
}

impl Default for LifecycleHub {
    fn default() -> Self {
        Self::new(256)
    }
}
