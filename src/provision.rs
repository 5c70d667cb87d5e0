//! Backing collection provisioning.

use crate::config::{ChannelConfig, EXPIRE_AT_FIELD};
use crate::error::{ChannelError, Result};
use crate::store::DocumentStore;
use crate::types::CollectionInfo;
use std::time::Duration;
use tracing::{info, warn};

/// Make sure the channel's collection exists, creating it if needed.
///
/// Creation failure is fatal. For a newly created unbounded collection the
/// change feed and the expiry index are set up best-effort: failures are
/// logged and the collection is still returned.
pub async fn ensure_collection(
    store: &dyn DocumentStore,
    config: &ChannelConfig,
) -> Result<CollectionInfo> {
    if let Some(existing) = find(store, &config.name).await? {
        if existing.options.bounded != config.bounded {
            warn!(
                channel = %config.name,
                configured_bounded = config.bounded,
                actual_bounded = existing.options.bounded,
                "existing collection shape differs from configuration"
            );
        }
        return Ok(existing);
    }

    let collection = match store
        .create_collection(&config.name, config.collection_options())
        .await
    {
        Ok(collection) => collection,
        // Another process won the race.
        Err(ChannelError::CollectionExists(_)) => {
            return find(store, &config.name)
                .await?
                .ok_or_else(|| ChannelError::CollectionNotFound(config.name.clone()));
        }
        Err(e) => return Err(ChannelError::Provisioning(e.to_string())),
    };
    info!(channel = %config.name, bounded = config.bounded, "created channel collection");

    if !collection.options.bounded {
        if let Err(e) = store.enable_change_feed(&config.name).await {
            warn!(channel = %config.name, error = %e, "could not enable change feed");
        }
        // The entry's expireAt is already the expiry instant.
        if let Err(e) = store
            .create_expiry_index(&config.name, EXPIRE_AT_FIELD, Duration::ZERO)
            .await
        {
            warn!(channel = %config.name, error = %e, "could not create expiry index");
        }
    }

    Ok(collection)
}

async fn find(store: &dyn DocumentStore, name: &str) -> Result<Option<CollectionInfo>> {
    let collections = store
        .list_collections()
        .await
        .map_err(|e| ChannelError::Provisioning(e.to_string()))?;
    Ok(collections.into_iter().find(|c| c.name == name))
}
