//! Log followers.
//!
//! A follower delivers every entry appended after a resumption point. There
//! are two ways to do that, picked by how the collection is provisioned:
//! - [`FollowStrategy::BoundedLog`]: a tailing cursor over a rotating log
//! - [`FollowStrategy::ChangeFeed`]: insert notifications from an unbounded
//!   collection
//!
//! Both produce the same entry stream, and one driver task turns that stream
//! into [`FollowerEvent`]s:
//!
//! ```text
//! Following ──entry──▶ Following
//!     │ error            │ stream ended          │ stop()
//!     ▼                  ▼                       ▼
//!   Failed ─────────▶ Closed ◀──────────── Ended
//! ```
//!
//! `Close` is always the last event. A failed follower is not restarted.

mod bounded;
mod change_feed;

use crate::error::{ChannelError, Result};
use crate::store::{DocumentStore, EntryStream};
use crate::types::{EntryId, LogEntry};
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// How a follower observes new entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowStrategy {
    /// Tailing cursor over a bounded, rotating collection.
    BoundedLog,
    /// Change notifications from an unbounded collection.
    ChangeFeed,
}

impl FollowStrategy {
    pub fn for_bounded(bounded: bool) -> Self {
        if bounded {
            FollowStrategy::BoundedLog
        } else {
            FollowStrategy::ChangeFeed
        }
    }

    async fn open(
        self,
        store: &dyn DocumentStore,
        collection: &str,
        after: EntryId,
    ) -> Result<EntryStream> {
        match self {
            FollowStrategy::BoundedLog => bounded::open(store, collection, after).await,
            FollowStrategy::ChangeFeed => change_feed::open(store, collection, after).await,
        }
    }
}

/// What a follower reports.
#[derive(Clone, Debug)]
pub enum FollowerEvent {
    Entry(LogEntry),
    Error(Arc<ChannelError>),
    End,
    Close,
}

/// Where a follower is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowerState {
    Following,
    Ended,
    Failed,
    Closed,
}

/// A running follower. Dropping the handle stops it.
pub struct FollowerHandle {
    strategy: FollowStrategy,
    after: EntryId,
    state: Arc<Mutex<FollowerState>>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FollowerHandle {
    pub fn strategy(&self) -> FollowStrategy {
        self.strategy
    }

    /// Resumption point this follower started after.
    pub fn resumed_after(&self) -> EntryId {
        self.after
    }

    pub fn state(&self) -> FollowerState {
        *self.state.lock()
    }

    /// Ask the follower to release its cursor or feed.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            match self.strategy {
                FollowStrategy::BoundedLog => debug!("destroying tailing cursor"),
                FollowStrategy::ChangeFeed => debug!("closing change feed"),
            }
            let _ = stop.send(());
        }
    }

    /// Stop and wait for the driver task to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        let _ = self.task.await;
    }
}

/// Open the strategy's stream after entry `after` and start delivering to `sink`.
///
/// Opening errors are returned to the caller; everything after that is
/// reported through the sink.
pub async fn start<F>(
    store: Arc<dyn DocumentStore>,
    collection: &str,
    strategy: FollowStrategy,
    after: EntryId,
    sink: F,
) -> Result<FollowerHandle>
where
    F: Fn(FollowerEvent) + Send + Sync + 'static,
{
    let stream = strategy.open(store.as_ref(), collection, after).await?;

    let (stop_tx, stop_rx) = oneshot::channel();
    let state = Arc::new(Mutex::new(FollowerState::Following));
    let task = tokio::spawn(drive(
        stream,
        stop_rx,
        Arc::clone(&state),
        sink,
        collection.to_string(),
    ));

    Ok(FollowerHandle {
        strategy,
        after,
        state,
        stop: Some(stop_tx),
        task,
    })
}

async fn drive<F>(
    mut stream: EntryStream,
    mut stop: oneshot::Receiver<()>,
    state: Arc<Mutex<FollowerState>>,
    sink: F,
    collection: String,
) where
    F: Fn(FollowerEvent),
{
    loop {
        tokio::select! {
            biased;

            // Fires on stop() and when the handle is dropped.
            _ = &mut stop => break,

            next = stream.next() => match next {
                Some(Ok(entry)) => sink(FollowerEvent::Entry(entry)),
                Some(Err(e)) => {
                    error!(collection = %collection, error = %e, "follower failed");
                    *state.lock() = FollowerState::Failed;
                    sink(FollowerEvent::Error(Arc::new(e)));
                    break;
                }
                None => {
                    debug!(collection = %collection, "follower stream ended");
                    *state.lock() = FollowerState::Ended;
                    sink(FollowerEvent::End);
                    break;
                }
            }
        }
    }

    drop(stream);
    *state.lock() = FollowerState::Closed;
    sink(FollowerEvent::Close);
}
