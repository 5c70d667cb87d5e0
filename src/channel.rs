//! The channel: publish, subscribe and lifecycle over one backing collection.

use crate::config::{ChannelConfig, EXPIRY_HORIZON};
use crate::error::{ChannelError, Result};
use crate::fanout::{Fanout, Subscription, WILDCARD_EVENT};
use crate::follower::{self, FollowStrategy, FollowerEvent, FollowerHandle};
use crate::lifecycle::{
    ChannelEvent, LifecycleFilter, LifecycleHandle, LifecycleHub, LifecycleId,
};
use crate::provision;
use crate::resolve;
use crate::store::DocumentStore;
use crate::types::{CollectionInfo, EntryId, LogEntry, NewEntry, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where a channel is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Provisioning,
    Resolving,
    Listening,
    Closed,
    /// Provisioning or resolution failed. Terminal.
    Failed(String),
}

struct ChannelInner {
    config: ChannelConfig,
    store: Arc<dyn DocumentStore>,
    collection: RwLock<Option<CollectionInfo>>,
    fanout: Arc<Fanout>,
    lifecycle: LifecycleHub,
    follower: Mutex<Option<FollowerHandle>>,
    /// Newest entry handed to the fan-out. Held across dispatch so that an
    /// outgoing and an incoming follower never interleave.
    last_dispatched: Mutex<Option<EntryId>>,
    state: watch::Sender<ChannelState>,
    closed: AtomicBool,
    /// Serializes concurrent `listen` calls.
    listen_lock: tokio::sync::Mutex<()>,
}

impl ChannelInner {
    fn set_state(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            // Closed and Failed are terminal.
            if matches!(current, ChannelState::Closed | ChannelState::Failed(_))
                || *current == next
            {
                return false;
            }
            debug!(channel = %self.config.name, from = ?current, to = ?next, "channel state");
            *current = next;
            true
        });
    }

    fn fail(&self, error: ChannelError) -> ChannelError {
        error!(channel = %self.config.name, error = %error, "channel failed to start");
        self.set_state(ChannelState::Failed(error.to_string()));
        error
    }

    fn on_follower_event(&self, event: FollowerEvent) {
        match event {
            FollowerEvent::Entry(entry) => {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                let mut last = self.last_dispatched.lock();
                if last.map_or(false, |seen| entry.id <= seen) {
                    debug!(
                        channel = %self.config.name,
                        entry_id = %entry.id,
                        "skipping already dispatched entry"
                    );
                    return;
                }
                *last = Some(entry.id);
                let delivered = self.fanout.dispatch(&entry);
                debug!(channel = %self.config.name, entry_id = %entry.id, delivered, "dispatched entry");
            }
            FollowerEvent::Error(error) => {
                self.lifecycle.emit(ChannelEvent::CursorError { error });
            }
            FollowerEvent::End => self.lifecycle.emit(ChannelEvent::CursorEnd),
            FollowerEvent::Close => self.lifecycle.emit(ChannelEvent::CursorClose),
        }
    }

    async fn ensure_provisioned(&self) -> Result<CollectionInfo> {
        if let Some(collection) = self.collection.read().clone() {
            return Ok(collection);
        }

        self.set_state(ChannelState::Provisioning);
        let collection = provision::ensure_collection(self.store.as_ref(), &self.config).await?;
        *self.collection.write() = Some(collection.clone());
        self.lifecycle.emit(ChannelEvent::Collection {
            collection: collection.clone(),
        });
        Ok(collection)
    }
}

/// A named publish/subscribe channel backed by one store collection.
///
/// Publishing appends an entry to the collection; a follower task observes
/// appended entries and hands each one to the listeners registered for its
/// event name and to the wildcard `"message"` listeners. Local publishes make
/// the same round trip through the store as remote ones.
///
/// `Channel` is a cheap handle; clones share the same follower and listeners.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(MemoryStore::new());
/// let channel = Channel::open(ChannelConfig::new("orders"), store).await?;
///
/// let sub = channel.subscribe("created", |order| println!("{order}"))?;
/// channel.publish("created", &json!({"id": 7})).await?;
///
/// sub.unsubscribe();
/// channel.close();
/// ```
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel without touching the store.
    pub fn new(config: ChannelConfig, store: Arc<dyn DocumentStore>) -> Self {
        let (state, _) = watch::channel(ChannelState::Uninitialized);
        let lifecycle = LifecycleHub::new(config.lifecycle_buffer);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                store,
                collection: RwLock::new(None),
                fanout: Arc::new(Fanout::new()),
                lifecycle,
                follower: Mutex::new(None),
                last_dispatched: Mutex::new(None),
                state,
                closed: AtomicBool::new(false),
                listen_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a channel and wait until it is listening.
    pub async fn open(config: ChannelConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let channel = Self::new(config, store);
        channel.listen(None).await?;
        Ok(channel)
    }

    /// Create a channel and start listening in the background.
    ///
    /// Use [`Channel::ready`] to wait for it. Must be called inside a tokio
    /// runtime.
    pub fn spawn(config: ChannelConfig, store: Arc<dyn DocumentStore>) -> Self {
        let channel = Self::new(config, store);
        let background = channel.clone();
        tokio::spawn(async move {
            // Failures are recorded in the channel state for `ready`.
            let _ = background.listen(None).await;
        });
        channel
    }

    /// Attach a follower, provisioning and resolving as needed.
    ///
    /// With `marker`, the follower resumes after that entry (re-read from the
    /// store); otherwise after the entry picked by the configured
    /// [`ResumeFrom`](crate::ResumeFrom) rule. Either way it never resumes
    /// before the newest entry this channel already dispatched, so calling
    /// this again (to reconnect after a cursor error, say) replaces the
    /// follower without replaying anything. Emits `ready` once per
    /// successful call.
    ///
    /// A failure before the first follower is attached leaves the channel
    /// [`ChannelState::Failed`]. Once it has been listening, a failed call is
    /// only reported to the caller and the channel stays listening.
    pub async fn listen(&self, marker: Option<LogEntry>) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if let ChannelState::Failed(reason) = self.state() {
            return Err(ChannelError::Failed(reason));
        }

        let _guard = inner.listen_lock.lock().await;

        let attached = inner.follower.lock().is_some();
        let fail = |e: ChannelError| {
            if attached {
                warn!(
                    channel = %inner.config.name,
                    error = %e,
                    "relisten failed, keeping current follower"
                );
                inner.set_state(ChannelState::Listening);
                e
            } else {
                inner.fail(e)
            }
        };

        let collection = inner.ensure_provisioned().await.map_err(fail)?;

        inner.set_state(ChannelState::Resolving);
        let resolved = resolve::resolve_resumption(
            inner.store.as_ref(),
            &collection.name,
            marker.as_ref(),
            inner.config.resume_from,
        )
        .await
        .map_err(fail)?;

        let after = match *inner.last_dispatched.lock() {
            Some(last) if last > resolved.id => last,
            _ => resolved.id,
        };

        let strategy = FollowStrategy::for_bounded(inner.config.bounded);
        let weak: Weak<ChannelInner> = Arc::downgrade(inner);
        let handle = follower::start(
            Arc::clone(&inner.store),
            &collection.name,
            strategy,
            after,
            move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_follower_event(event);
                }
            },
        )
        .await
        .map_err(fail)?;

        {
            let mut follower = inner.follower.lock();
            if inner.closed.load(Ordering::SeqCst) {
                drop(follower);
                drop(handle);
                return Err(ChannelError::Closed);
            }
            if let Some(mut previous) = follower.replace(handle) {
                debug!(channel = %inner.config.name, "replacing previous follower");
                previous.stop();
            }
        }

        inner.set_state(ChannelState::Listening);
        info!(
            channel = %inner.config.name,
            strategy = ?strategy,
            after = %after,
            "channel listening"
        );
        inner.lifecycle.emit(ChannelEvent::Ready { listening: true });
        Ok(())
    }

    /// Wait until the channel is listening.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ChannelState::Listening => return Ok(()),
                ChannelState::Closed => return Err(ChannelError::Closed),
                ChannelState::Failed(reason) => return Err(ChannelError::Failed(reason)),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ChannelError::Closed);
            }
        }
    }

    /// Append a message to the channel's log.
    ///
    /// Returns once the store acknowledged the write. Unbounded channels stamp
    /// the entry with an expiry [`EXPIRY_HORIZON`] from now; bounded channels
    /// rely on rotation instead.
    pub async fn publish<T: Serialize + ?Sized>(&self, event: &str, message: &T) -> Result<EntryId> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let collection = inner
            .collection
            .read()
            .as_ref()
            .map(|c| c.name.clone())
            .ok_or(ChannelError::NotListening)?;

        let mut entry = NewEntry::message(event, serde_json::to_value(message)?);
        if !inner.config.bounded {
            entry = entry.expiring_at(Timestamp::now().plus(EXPIRY_HORIZON));
        }

        let id = inner.store.insert(&collection, entry).await.map_err(|e| {
            warn!(channel = %inner.config.name, event, error = %e, "publish failed");
            e
        })?;
        debug!(channel = %inner.config.name, event, entry_id = %id, "published");
        Ok(id)
    }

    /// Register `callback` for messages published under `event`.
    ///
    /// Subscribing to `"message"` receives every published message.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(self.inner.fanout.subscribe(event, Arc::new(callback)))
    }

    /// Register `callback` for every published message.
    pub fn subscribe_all<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(WILDCARD_EVENT, callback)
    }

    /// Like [`Channel::subscribe`], decoding each message into `T`.
    ///
    /// Messages that do not decode are logged and skipped.
    pub fn subscribe_as<T, F>(&self, event: &str, callback: F) -> Result<Subscription>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = self.inner.config.name.clone();
        let event_name = event.to_string();
        self.subscribe(event, move |value| match T::deserialize(value) {
            Ok(message) => callback(message),
            Err(e) => warn!(channel = %name, event = %event_name, error = %e, "undecodable message"),
        })
    }

    /// Receive lifecycle events (`ready`, `collection`, `cursor-*`).
    pub fn events(&self) -> LifecycleHandle {
        self.inner.lifecycle.subscribe()
    }

    /// Receive the lifecycle events matching `filter`.
    pub fn events_filtered(&self, filter: LifecycleFilter) -> LifecycleHandle {
        self.inner.lifecycle.subscribe_filtered(filter)
    }

    /// Stop a lifecycle subscription started with [`Channel::events`].
    pub fn unsubscribe_events(&self, id: LifecycleId) {
        self.inner.lifecycle.unsubscribe(id);
    }

    /// Close the channel.
    ///
    /// Stops the follower, releasing its cursor or feed, and removes every
    /// listener. Lifecycle subscribers get `ready` (not listening) and are
    /// then dropped. Safe to call in any state; later calls do nothing.
    pub fn close(&self) -> &Self {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return self;
        }

        if let Some(mut follower) = inner.follower.lock().take() {
            follower.stop();
        }
        inner.fanout.clear();
        inner.lifecycle.emit(ChannelEvent::Ready { listening: false });
        inner.lifecycle.close_all();
        inner.state.send_replace(ChannelState::Closed);
        info!(channel = %inner.config.name, "channel closed");
        self
    }

    // --- Accessors ---

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ChannelState::Listening
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The provisioned collection, once known.
    pub fn collection(&self) -> Option<CollectionInfo> {
        self.inner.collection.read().clone()
    }

    /// Strategy of the active follower, if one is attached.
    pub fn follow_strategy(&self) -> Option<FollowStrategy> {
        self.inner.follower.lock().as_ref().map(|f| f.strategy())
    }

    /// Entry the active follower resumed after, if one is attached.
    pub fn resumed_after(&self) -> Option<EntryId> {
        self.inner.follower.lock().as_ref().map(|f| f.resumed_after())
    }

    /// Number of listeners registered under `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.fanout.listener_count(event)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let store = Arc::new(MemoryStore::new());
        let channel = Channel::new(ChannelConfig::new("c"), store);
        assert_eq!(channel.state(), ChannelState::Uninitialized);

        channel.listen(None).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Listening);
        assert_eq!(channel.follow_strategy(), Some(FollowStrategy::ChangeFeed));

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.follow_strategy(), None);
    }

    #[tokio::test]
    async fn test_bounded_uses_tailing_cursor() {
        let store = Arc::new(MemoryStore::new());
        let channel = Channel::open(ChannelConfig::new("c").bounded(100_000, None), store)
            .await
            .unwrap();
        assert_eq!(channel.follow_strategy(), Some(FollowStrategy::BoundedLog));
    }

    #[tokio::test]
    async fn test_publish_sets_expiry_only_when_unbounded() {
        let store = Arc::new(MemoryStore::new());
        let unbounded = Channel::open(ChannelConfig::new("u"), store.clone()).await.unwrap();
        let bounded = Channel::open(ChannelConfig::new("b").bounded(100_000, None), store.clone())
            .await
            .unwrap();

        let before = Timestamp::now();
        let u_id = unbounded.publish("e", &json!(1)).await.unwrap();
        let b_id = bounded.publish("e", &json!(1)).await.unwrap();

        let u_entry = store.find_by_id("u", u_id).await.unwrap().unwrap();
        let b_entry = store.find_by_id("b", b_id).await.unwrap().unwrap();
        assert!(u_entry.expire_at.unwrap() >= before.plus(EXPIRY_HORIZON));
        assert!(b_entry.expire_at.is_none());
    }

    #[tokio::test]
    async fn test_spawned_channel_becomes_ready() {
        let store = Arc::new(MemoryStore::new());
        let channel = Channel::spawn(ChannelConfig::new("c"), store);
        channel.ready().await.unwrap();
        assert!(channel.is_listening());
        assert!(channel.collection().is_some());
    }

    #[tokio::test]
    async fn test_relisten_replaces_follower() {
        let store = Arc::new(MemoryStore::new());
        let channel = Channel::open(ChannelConfig::new("c"), store.clone()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel
            .subscribe_all(move |v| sink.lock().push(v.clone()))
            .unwrap();

        channel.listen(None).await.unwrap();
        wait_until(|| store.watcher_count("c").unwrap() == 1).await;

        channel.publish("e", &json!("once")).await.unwrap();
        wait_until(|| !seen.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec![json!("once")]);
    }

    #[tokio::test]
    async fn test_subscribe_as_decodes() {
        #[derive(serde::Deserialize)]
        struct Order {
            id: u32,
        }

        let store = Arc::new(MemoryStore::new());
        let channel = Channel::open(ChannelConfig::new("c"), store).await.unwrap();
        let ids = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ids);
        channel
            .subscribe_as("order", move |order: Order| sink.lock().push(order.id))
            .unwrap();

        channel.publish("order", &json!({"id": 7})).await.unwrap();
        channel.publish("order", &json!("not an order")).await.unwrap();
        channel.publish("order", &json!({"id": 8})).await.unwrap();

        wait_until(|| ids.lock().len() == 2).await;
        assert_eq!(*ids.lock(), vec![7, 8]);
    }
}
