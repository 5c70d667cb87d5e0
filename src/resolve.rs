//! Resumption point resolution.
//!
//! A follower only ever delivers entries strictly after the entry returned
//! here, so attaching a channel does not replay the log from the start.

use crate::config::ResumeFrom;
use crate::error::{ChannelError, Result};
use crate::store::{DocumentStore, SortOrder};
use crate::types::{LogEntry, NewEntry};
use tracing::debug;

/// Find the entry to resume after.
///
/// - An explicit marker is re-read by id so a stale copy is never used.
/// - Otherwise the first entry in `resume_from` order is used.
/// - An empty log (or a marker that no longer exists) gets a fresh marker
///   entry with no event name.
pub async fn resolve_resumption(
    store: &dyn DocumentStore,
    collection: &str,
    explicit: Option<&LogEntry>,
    resume_from: ResumeFrom,
) -> Result<LogEntry> {
    let found = match explicit {
        Some(marker) => store.find_by_id(collection, marker.id).await,
        None => {
            let order = match resume_from {
                ResumeFrom::Oldest => SortOrder::Natural,
                ResumeFrom::Latest => SortOrder::Reverse,
            };
            store.find_first(collection, order).await
        }
    }
    .map_err(|e| ChannelError::Resolution(e.to_string()))?;

    if let Some(entry) = found {
        debug!(collection, entry_id = %entry.id, "resuming after existing entry");
        return Ok(entry);
    }

    let marker = NewEntry::marker();
    let id = store
        .insert(collection, marker.clone())
        .await
        .map_err(|e| ChannelError::Resolution(e.to_string()))?;
    debug!(collection, entry_id = %id, "created marker entry");
    Ok(marker.into_entry(id))
}
