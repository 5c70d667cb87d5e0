//! In-process document store.
//!
//! Mirrors the behaviour channels rely on from a real document database:
//! bounded collections rotate their oldest entries out once over capacity,
//! tailing cursors block for new data and fail once rotation overtakes
//! their position, and change feeds must be enabled per collection before
//! they can be watched.

use super::{
    ChangeEvent, ChangeFilter, ChangeStream, DocumentStore, EntryStream, SortOrder, TailQuery,
};
use crate::config::{DEFAULT_BOUNDED_SIZE, EXPIRE_AT_FIELD};
use crate::error::{ChannelError, Result};
use crate::types::{CollectionInfo, CollectionOptions, EntryId, LogEntry, NewEntry, Timestamp};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// One-shot failures armed by tests.
#[derive(Default)]
struct FailurePlan {
    next_insert: Option<String>,
    next_create: Option<String>,
    next_query: Option<String>,
    change_feed_enable: Option<String>,
}

struct ExpiryIndex {
    expire_after: Duration,
}

struct StoredEntry {
    entry: LogEntry,
    /// Encoded size in bytes.
    size: u64,
}

type Watcher = (ChangeFilter, mpsc::UnboundedSender<Result<ChangeEvent>>);

struct CollectionState {
    entries: VecDeque<StoredEntry>,
    next_id: u64,
    bytes: u64,
    change_feed_enabled: bool,
    expiry_index: Option<ExpiryIndex>,
    watchers: Vec<Watcher>,
    /// Cursors opened before this epoch fail on their next read.
    failure_epoch: u64,
    failure_message: String,
    dropped: bool,
}

impl CollectionState {
    /// Evict the oldest entries until within capacity. Returns how many went.
    fn rotate(&mut self, options: &CollectionOptions) -> usize {
        let size_limit = options.size_bytes.unwrap_or(DEFAULT_BOUNDED_SIZE);
        let mut evicted = 0;

        while self.entries.len() > 1 {
            let over_count = options
                .max_entries
                .map_or(false, |max| self.entries.len() as u64 > max);
            if !over_count && self.bytes <= size_limit {
                break;
            }
            if let Some(oldest) = self.entries.pop_front() {
                self.bytes -= oldest.size;
                evicted += 1;
            }
        }

        evicted
    }

    /// Push a change to every watcher whose filter matches, dropping closed feeds.
    fn notify_watchers(&mut self, change: &ChangeEvent) {
        self.watchers.retain(|(filter, tx)| {
            if tx.is_closed() {
                return false;
            }
            if filter.matches(change) {
                tx.send(Ok(change.clone())).is_ok()
            } else {
                true
            }
        });
    }

    fn position_of(&self, id: EntryId) -> usize {
        self.entries.partition_point(|stored| stored.entry.id < id)
    }
}

/// Outcome of one tailing read.
enum TailStep {
    Entry(LogEntry),
    Empty,
    Lost { last_seen: EntryId, oldest: EntryId },
    Failed(String),
    Dropped,
}

struct MemoryCollection {
    info: CollectionInfo,
    state: Mutex<CollectionState>,
    /// Bumped whenever open cursors should re-check the collection.
    wakeup: watch::Sender<u64>,
}

impl MemoryCollection {
    fn new(info: CollectionInfo) -> Self {
        let (wakeup, _) = watch::channel(0);
        Self {
            info,
            state: Mutex::new(CollectionState {
                entries: VecDeque::new(),
                next_id: 1,
                bytes: 0,
                change_feed_enabled: false,
                expiry_index: None,
                watchers: Vec::new(),
                failure_epoch: 0,
                failure_message: String::new(),
                dropped: false,
            }),
            wakeup,
        }
    }

    fn wake(&self) {
        self.wakeup.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn append(&self, entry: NewEntry) -> Result<EntryId> {
        let id = {
            let mut state = self.state.lock();
            let id = EntryId(state.next_id);
            let entry = entry.into_entry(id);
            let size = rmp_serde::to_vec_named(&entry)?.len() as u64;

            state.next_id += 1;
            state.bytes += size;
            let change = ChangeEvent::insert(entry.clone());
            state.entries.push_back(StoredEntry { entry, size });

            if self.info.options.bounded {
                let evicted = state.rotate(&self.info.options);
                if evicted > 0 {
                    debug!(collection = %self.info.name, evicted, "rotated bounded collection");
                }
            }

            state.notify_watchers(&change);
            id
        };

        self.wake();
        Ok(id)
    }

    fn poll_tail(&self, after: EntryId, position: Option<EntryId>, epoch: u64) -> TailStep {
        let state = self.state.lock();

        if state.dropped {
            return TailStep::Dropped;
        }
        if state.failure_epoch > epoch {
            return TailStep::Failed(state.failure_message.clone());
        }
        if let (Some(last_seen), Some(front)) = (position, state.entries.front()) {
            if last_seen < front.entry.id {
                return TailStep::Lost {
                    last_seen,
                    oldest: front.entry.id,
                };
            }
        }

        let floor = position.map_or(after, |p| p.max(after));
        let idx = state.entries.partition_point(|stored| stored.entry.id <= floor);
        match state.entries.get(idx) {
            Some(stored) => TailStep::Entry(stored.entry.clone()),
            None => TailStep::Empty,
        }
    }
}

/// A tailing cursor over a bounded collection.
struct TailCursor {
    collection: Arc<MemoryCollection>,
    wakeup: watch::Receiver<u64>,
    after: EntryId,
    /// Last entry handed out; unset until the first read.
    position: Option<EntryId>,
    epoch: u64,
    await_data: bool,
    done: bool,
}

impl TailCursor {
    async fn next_entry(&mut self) -> Option<Result<LogEntry>> {
        if self.done {
            return None;
        }

        loop {
            self.wakeup.borrow_and_update();

            match self.collection.poll_tail(self.after, self.position, self.epoch) {
                TailStep::Entry(entry) => {
                    self.position = Some(entry.id);
                    return Some(Ok(entry));
                }
                TailStep::Lost { last_seen, oldest } => {
                    self.done = true;
                    return Some(Err(ChannelError::CursorLost { last_seen, oldest }));
                }
                TailStep::Failed(message) => {
                    self.done = true;
                    return Some(Err(ChannelError::Store(message)));
                }
                TailStep::Dropped => return None,
                TailStep::Empty => {
                    if !self.await_data || self.wakeup.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

/// In-process [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<MemoryCollection>>>,
    failures: Mutex<FailurePlan>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, name: &str) -> Result<Arc<MemoryCollection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ChannelError::CollectionNotFound(name.to_string()))
    }

    fn take_query_failure(&self) -> Result<()> {
        match self.failures.lock().next_query.take() {
            Some(message) => Err(ChannelError::Store(message)),
            None => Ok(()),
        }
    }

    // --- Inspection ---

    /// Snapshot of the entries currently retained, oldest first.
    pub fn entries(&self, name: &str) -> Result<Vec<LogEntry>> {
        let collection = self.collection(name)?;
        let state = collection.state.lock();
        Ok(state.entries.iter().map(|stored| stored.entry.clone()).collect())
    }

    /// Number of entries currently retained.
    pub fn len(&self, name: &str) -> Result<usize> {
        Ok(self.collection(name)?.state.lock().entries.len())
    }

    pub fn is_change_feed_enabled(&self, name: &str) -> Result<bool> {
        Ok(self.collection(name)?.state.lock().change_feed_enabled)
    }

    /// Expiry delay of the collection's expiry index, if it has one.
    pub fn expiry_index(&self, name: &str) -> Result<Option<Duration>> {
        let collection = self.collection(name)?;
        let state = collection.state.lock();
        Ok(state.expiry_index.as_ref().map(|index| index.expire_after))
    }

    /// Number of open change feeds on a collection.
    pub fn watcher_count(&self, name: &str) -> Result<usize> {
        let collection = self.collection(name)?;
        let mut state = collection.state.lock();
        state.watchers.retain(|(_, tx)| !tx.is_closed());
        Ok(state.watchers.len())
    }

    // --- Maintenance ---

    /// Run the expiry sweep as of `now`. Returns how many entries were removed.
    ///
    /// An entry expires once `expireAt + expire_after <= now`. Collections
    /// without an expiry index are left untouched.
    pub fn purge_expired(&self, name: &str, now: Timestamp) -> Result<usize> {
        let collection = self.collection(name)?;
        let removed = {
            let mut state = collection.state.lock();
            let expire_after = match &state.expiry_index {
                Some(index) => index.expire_after,
                None => return Ok(0),
            };

            let mut removed = Vec::new();
            let mut kept = VecDeque::with_capacity(state.entries.len());
            for stored in state.entries.drain(..) {
                let expired = stored
                    .entry
                    .expire_at
                    .map_or(false, |at| at.plus(expire_after) <= now);
                if expired {
                    removed.push(stored);
                } else {
                    kept.push_back(stored);
                }
            }
            state.entries = kept;

            for stored in &removed {
                state.bytes -= stored.size;
                state.notify_watchers(&ChangeEvent::delete(stored.entry.id));
            }
            removed.len()
        };

        if removed > 0 {
            debug!(collection = name, removed, "purged expired entries");
            collection.wake();
        }
        Ok(removed)
    }

    /// Drop a collection. Open cursors and feeds end.
    pub fn drop_collection(&self, name: &str) -> bool {
        let Some(collection) = self.collections.write().remove(name) else {
            return false;
        };

        {
            let mut state = collection.state.lock();
            state.dropped = true;
            state.watchers.clear();
        }
        collection.wake();
        true
    }

    // --- Failure injection ---

    /// Fail the next insert with a store error.
    pub fn fail_next_insert(&self, message: impl Into<String>) {
        self.failures.lock().next_insert = Some(message.into());
    }

    /// Fail the next collection creation with a store error.
    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.failures.lock().next_create = Some(message.into());
    }

    /// Fail the next lookup (`find_by_id` or `find_first`).
    pub fn fail_next_query(&self, message: impl Into<String>) {
        self.failures.lock().next_query = Some(message.into());
    }

    /// Fail the next change feed enable request.
    pub fn fail_change_feed_enable(&self, message: impl Into<String>) {
        self.failures.lock().change_feed_enable = Some(message.into());
    }

    /// Fail every cursor and feed currently open on a collection.
    pub fn fail_cursors(&self, name: &str, message: impl Into<String>) -> Result<()> {
        let collection = self.collection(name)?;
        let message = message.into();

        {
            let mut state = collection.state.lock();
            state.failure_epoch += 1;
            state.failure_message = message.clone();
            for (_, tx) in state.watchers.drain(..) {
                let _ = tx.send(Err(ChannelError::Store(message.clone())));
            }
        }
        collection.wake();
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let mut infos: Vec<CollectionInfo> = self
            .collections
            .read()
            .values()
            .map(|collection| collection.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<CollectionInfo> {
        if let Some(message) = self.failures.lock().next_create.take() {
            return Err(ChannelError::Store(message));
        }

        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(ChannelError::CollectionExists(name.to_string()));
        }

        let info = CollectionInfo {
            name: name.to_string(),
            options,
        };
        collections.insert(name.to_string(), Arc::new(MemoryCollection::new(info.clone())));
        debug!(collection = name, bounded = info.options.bounded, "created collection");
        Ok(info)
    }

    async fn enable_change_feed(&self, name: &str) -> Result<()> {
        if let Some(message) = self.failures.lock().change_feed_enable.take() {
            return Err(ChannelError::Store(message));
        }
        self.collection(name)?.state.lock().change_feed_enabled = true;
        Ok(())
    }

    async fn create_expiry_index(
        &self,
        name: &str,
        field: &str,
        expire_after: Duration,
    ) -> Result<()> {
        let collection = self.collection(name)?;
        if collection.info.options.bounded {
            return Err(ChannelError::InvalidOperation(
                "expiry indexes are not supported on bounded collections".to_string(),
            ));
        }
        if field != EXPIRE_AT_FIELD {
            return Err(ChannelError::InvalidOperation(format!(
                "entries carry no expiry field named {field}"
            )));
        }

        collection.state.lock().expiry_index = Some(ExpiryIndex { expire_after });
        Ok(())
    }

    async fn insert(&self, name: &str, entry: NewEntry) -> Result<EntryId> {
        if let Some(message) = self.failures.lock().next_insert.take() {
            return Err(ChannelError::Store(message));
        }
        self.collection(name)?.append(entry)
    }

    async fn find_by_id(&self, name: &str, id: EntryId) -> Result<Option<LogEntry>> {
        self.take_query_failure()?;
        let collection = self.collection(name)?;
        let state = collection.state.lock();
        let idx = state.position_of(id);
        Ok(state
            .entries
            .get(idx)
            .filter(|stored| stored.entry.id == id)
            .map(|stored| stored.entry.clone()))
    }

    async fn find_first(&self, name: &str, order: SortOrder) -> Result<Option<LogEntry>> {
        self.take_query_failure()?;
        let collection = self.collection(name)?;
        let state = collection.state.lock();
        let stored = match order {
            SortOrder::Natural => state.entries.front(),
            SortOrder::Reverse => state.entries.back(),
        };
        Ok(stored.map(|stored| stored.entry.clone()))
    }

    async fn tail(&self, name: &str, query: TailQuery) -> Result<EntryStream> {
        let collection = self.collection(name)?;
        if !collection.info.options.bounded {
            return Err(ChannelError::InvalidOperation(
                "tailing cursors require a bounded collection".to_string(),
            ));
        }

        let epoch = collection.state.lock().failure_epoch;
        let cursor = TailCursor {
            wakeup: collection.wakeup.subscribe(),
            collection,
            after: query.after,
            position: None,
            epoch,
            await_data: query.await_data,
            done: false,
        };
        debug!(collection = name, after = %query.after, "opened tailing cursor");

        let stream = stream::unfold(cursor, |mut cursor| async move {
            cursor.next_entry().await.map(|item| (item, cursor))
        });
        Ok(stream.boxed())
    }

    async fn watch(&self, name: &str, filter: ChangeFilter) -> Result<ChangeStream> {
        let collection = self.collection(name)?;
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = collection.state.lock();
            if !state.change_feed_enabled {
                return Err(ChannelError::ChangeFeedDisabled(name.to_string()));
            }
            state.watchers.push((filter, tx));
        }
        debug!(collection = name, "opened change feed");

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
