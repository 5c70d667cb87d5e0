//! Error types for channels and their backing store.

use crate::types::EntryId;
use thiserror::Error;

/// Main error type for channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Could not resolve resumption point: {0}")]
    Resolution(String),

    #[error("Change feed not enabled for collection: {0}")]
    ChangeFeedDisabled(String),

    #[error("Cursor position lost: last seen {last_seen}, oldest retained {oldest}")]
    CursorLost { last_seen: EntryId, oldest: EntryId },

    #[error("Channel is closed")]
    Closed,

    #[error("Channel is not listening")]
    NotListening,

    #[error("Channel failed to start: {0}")]
    Failed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ChannelError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
