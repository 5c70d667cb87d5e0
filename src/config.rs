//! Channel configuration.

use crate::types::CollectionOptions;
use serde::Deserialize;
use std::time::Duration;

/// How long an unbounded-mode entry lives before the store expires it.
pub const EXPIRY_HORIZON: Duration = Duration::from_secs(1_296_000);

/// Document field carrying the expiry timestamp.
pub const EXPIRE_AT_FIELD: &str = "expireAt";

/// Bounded collection capacity when none is configured.
pub const DEFAULT_BOUNDED_SIZE: u64 = 100_000;

/// Channel name when none is configured.
pub const DEFAULT_CHANNEL_NAME: &str = "mubsub";

/// Which existing entry becomes the resumption point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFrom {
    /// The oldest entry still in the log.
    #[default]
    Oldest,
    /// The newest entry in the log.
    Latest,
}

/// Channel configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel name, also the backing collection name.
    pub name: String,

    /// Use a fixed-capacity rotating collection.
    pub bounded: bool,

    /// Capacity in bytes (bounded only).
    /// Default: 100_000
    pub size_bytes: u64,

    /// Capacity in entries (bounded only).
    pub max_entries: Option<u64>,

    /// Resumption rule when no explicit marker is given.
    pub resume_from: ResumeFrom,

    /// Max buffered lifecycle events per lifecycle subscriber.
    /// Default: 256
    pub lifecycle_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CHANNEL_NAME.to_string(),
            bounded: false,
            size_bytes: DEFAULT_BOUNDED_SIZE,
            max_entries: None,
            resume_from: ResumeFrom::Oldest,
            lifecycle_buffer: 256,
        }
    }
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Switch to a bounded rotating log.
    pub fn bounded(mut self, size_bytes: u64, max_entries: Option<u64>) -> Self {
        self.bounded = true;
        self.size_bytes = size_bytes;
        self.max_entries = max_entries;
        self
    }

    pub fn with_resume_from(mut self, resume_from: ResumeFrom) -> Self {
        self.resume_from = resume_from;
        self
    }

    pub fn with_lifecycle_buffer(mut self, buffer: usize) -> Self {
        self.lifecycle_buffer = buffer;
        self
    }

    /// Collection shape this configuration asks for.
    pub fn collection_options(&self) -> CollectionOptions {
        if self.bounded {
            CollectionOptions::bounded(self.size_bytes, self.max_entries)
        } else {
            CollectionOptions::unbounded()
        }
    }
}
