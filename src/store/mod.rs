//! Document store interface consumed by channels.
//!
//! A channel never talks to a database directly. Everything it needs from
//! the backing store goes through [`DocumentStore`]:
//! - collection enumeration and creation (bounded or unbounded)
//! - single-entry insert with a store-assigned, insertion-ordered id
//! - point and ordered lookups used to resolve a resumption point
//! - a tailing cursor over bounded collections
//! - a change feed over unbounded collections
//!
//! Streams returned by [`DocumentStore::tail`] and [`DocumentStore::watch`]
//! own their server-side resources; dropping the stream releases them.
//!
//! [`MemoryStore`] is a complete in-process implementation.

mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{CollectionInfo, CollectionOptions, EntryId, LogEntry, NewEntry};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::time::Duration;

/// Live stream of log entries from a tailing cursor.
pub type EntryStream = BoxStream<'static, Result<LogEntry>>;

/// Live stream of change notifications.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Order used when picking a single entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    /// Insertion order (oldest first).
    Natural,
    /// Reverse insertion order (newest first).
    Reverse,
}

/// Query for a tailing cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailQuery {
    /// Only entries with an id strictly greater than this.
    pub after: EntryId,
    /// Block for new data instead of ending when caught up.
    pub await_data: bool,
    /// Never time the cursor out server-side.
    pub no_cursor_timeout: bool,
}

impl TailQuery {
    /// A non-terminating cursor positioned after `after`.
    pub fn live_after(after: EntryId) -> Self {
        Self {
            after,
            await_data: true,
            no_cursor_timeout: true,
        }
    }
}

/// Kind of change reported by a change feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Delete,
}

/// A single change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationType,
    /// Id of the affected entry.
    pub document_key: EntryId,
    /// Full entry (inserts only).
    pub full_document: Option<LogEntry>,
}

impl ChangeEvent {
    pub fn insert(entry: LogEntry) -> Self {
        Self {
            operation: OperationType::Insert,
            document_key: entry.id,
            full_document: Some(entry),
        }
    }

    pub fn delete(id: EntryId) -> Self {
        Self {
            operation: OperationType::Delete,
            document_key: id,
            full_document: None,
        }
    }
}

/// Server-side filter applied to a change feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeFilter {
    /// Operation types to report (empty = all).
    pub operations: Vec<OperationType>,
    /// Only changes to entries with an id strictly greater than this.
    pub after: Option<EntryId>,
}

impl ChangeFilter {
    /// Inserts of entries newer than `after`.
    pub fn inserts_after(after: EntryId) -> Self {
        Self {
            operations: vec![OperationType::Insert],
            after: Some(after),
        }
    }

    pub fn matches(&self, change: &ChangeEvent) -> bool {
        if !self.operations.is_empty() && !self.operations.contains(&change.operation) {
            return false;
        }
        match self.after {
            Some(after) => change.document_key > after,
            None => true,
        }
    }
}

/// The narrow interface a channel needs from its document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Enumerate existing collections.
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    /// Create a collection with the given shape.
    async fn create_collection(&self, name: &str, options: CollectionOptions)
        -> Result<CollectionInfo>;

    /// Administrative toggle allowing change feeds on a collection.
    async fn enable_change_feed(&self, name: &str) -> Result<()>;

    /// Index that expires entries once `field` is older than `expire_after`.
    async fn create_expiry_index(&self, name: &str, field: &str, expire_after: Duration)
        -> Result<()>;

    /// Insert a single entry, returning its assigned id.
    async fn insert(&self, name: &str, entry: NewEntry) -> Result<EntryId>;

    /// Look up one entry by id.
    async fn find_by_id(&self, name: &str, id: EntryId) -> Result<Option<LogEntry>>;

    /// The first entry in the given order, if any.
    async fn find_first(&self, name: &str, order: SortOrder) -> Result<Option<LogEntry>>;

    /// Open a tailing cursor over a bounded collection.
    async fn tail(&self, name: &str, query: TailQuery) -> Result<EntryStream>;

    /// Open a change feed over a collection.
    async fn watch(&self, name: &str, filter: ChangeFilter) -> Result<ChangeStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewEntry;
    use serde_json::json;

    #[test]
    fn test_inserts_after_filter() {
        let filter = ChangeFilter::inserts_after(EntryId(5));

        let newer = ChangeEvent::insert(NewEntry::message("a", json!(1)).into_entry(EntryId(6)));
        let older = ChangeEvent::insert(NewEntry::message("a", json!(1)).into_entry(EntryId(5)));

        assert!(filter.matches(&newer));
        assert!(!filter.matches(&older));
        assert!(!filter.matches(&ChangeEvent::delete(EntryId(9))));
    }

    #[test]
    fn test_empty_operations_match_all() {
        let filter = ChangeFilter {
            operations: vec![],
            after: None,
        };
        assert!(filter.matches(&ChangeEvent::delete(EntryId(1))));
    }
}
