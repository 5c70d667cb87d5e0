//! Bounded-log strategy: a tailing cursor over a rotating collection.
//!
//! Entries that rotate out before the cursor reads them are gone. Once the
//! store reports that the cursor lost its position the stream fails and the
//! follower stops; nothing here tries to recover the gap.

use crate::error::Result;
use crate::store::{DocumentStore, EntryStream, TailQuery};
use crate::types::EntryId;
use tracing::debug;

/// Open a live cursor over entries strictly after `after`, in insertion order.
pub async fn open(store: &dyn DocumentStore, collection: &str, after: EntryId) -> Result<EntryStream> {
    let stream = store.tail(collection, TailQuery::live_after(after)).await?;
    debug!(collection, after = %after, "following bounded log");
    Ok(stream)
}
