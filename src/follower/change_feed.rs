//! Change-feed strategy: insert notifications from an unbounded collection.

use crate::error::Result;
use crate::store::{ChangeFilter, DocumentStore, EntryStream};
use crate::types::EntryId;
use futures_util::future;
use futures_util::stream::StreamExt;
use tracing::{debug, warn};

/// Subscribe to inserts of entries strictly after `after`.
///
/// Each notification is unwrapped to its full document so that the stream
/// looks exactly like a bounded-log cursor.
pub async fn open(store: &dyn DocumentStore, collection: &str, after: EntryId) -> Result<EntryStream> {
    let feed = store
        .watch(collection, ChangeFilter::inserts_after(after))
        .await?;
    debug!(collection, after = %after, "following change feed");

    let name = collection.to_string();
    let entries = feed.filter_map(move |change| {
        let item = match change {
            Ok(change) => match change.full_document {
                Some(entry) => Some(Ok(entry)),
                None => {
                    warn!(collection = %name, key = %change.document_key, "change without full document");
                    None
                }
            },
            Err(e) => Some(Err(e)),
        };
        future::ready(item)
    });
    Ok(entries.boxed())
}
