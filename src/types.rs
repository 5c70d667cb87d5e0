//! Core types shared by the channel and its store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Store-assigned identity of a log entry.
///
/// Ordering follows insertion order within one collection and is the only
/// ordering the channel relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EntryId(pub u64);

impl EntryId {
    pub fn next(self) -> Self {
        EntryId(self.0 + 1)
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// This timestamp shifted forward by `by`.
    pub fn plus(self, by: Duration) -> Self {
        Timestamp(self.0.saturating_add(by.as_millis() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single persisted record in a channel's log.
///
/// Entries without an event name are positional markers and are never
/// delivered to listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "_id")]
    pub id: EntryId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,

    /// Consumed by the store's expiry mechanism (unbounded collections only).
    #[serde(rename = "expireAt", default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<Timestamp>,
}

impl LogEntry {
    pub fn is_marker(&self) -> bool {
        self.event.is_none()
    }
}

/// Input for creating a new entry (before the store assigns an id).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewEntry {
    pub event: Option<String>,
    pub message: Option<serde_json::Value>,
    pub expire_at: Option<Timestamp>,
}

impl NewEntry {
    /// A positional marker with no event name.
    pub fn marker() -> Self {
        Self::default()
    }

    /// A published message.
    pub fn message(event: impl Into<String>, message: serde_json::Value) -> Self {
        Self {
            event: Some(event.into()),
            message: Some(message),
            expire_at: None,
        }
    }

    pub fn expiring_at(mut self, at: Timestamp) -> Self {
        self.expire_at = Some(at);
        self
    }

    /// Attach the identity the store assigned.
    pub fn into_entry(self, id: EntryId) -> LogEntry {
        LogEntry {
            id,
            event: self.event,
            message: self.message,
            expire_at: self.expire_at,
        }
    }
}

/// Shape of a backing collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Fixed-capacity rotating log.
    pub bounded: bool,

    /// Capacity in bytes (bounded only).
    pub size_bytes: Option<u64>,

    /// Capacity in entries (bounded only).
    pub max_entries: Option<u64>,
}

impl CollectionOptions {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn bounded(size_bytes: u64, max_entries: Option<u64>) -> Self {
        Self {
            bounded: true,
            size_bytes: Some(size_bytes),
            max_entries,
        }
    }
}

/// Diagnostic description of a provisioned collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub options: CollectionOptions,
}
