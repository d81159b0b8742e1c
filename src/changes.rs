//! Change feed: every committed write publishes a [`ChangeEvent`] and
//! per-collection [`Subscription`]s receive the ones for their table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::schema::Collection;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event: ChangeKind,
    pub table: Collection,
    /// The row after the write (before it, for deletes).
    pub record: Value,
}

/// Publisher side. Cloning shares the same channel.
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to whoever is listening. No listeners is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, collection: Collection) -> Subscription {
        Subscription {
            collection,
            rx: self.tx.subscribe(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// An open channel on one collection's changes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    collection: Collection,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Next event for this collection, or `None` once the feed is gone.
    /// Events lost to lag are skipped with a warning.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.table == self.collection => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(collection = %self.collection, missed, "change subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Resolves `true` when something changed in this collection (a lag
    /// counts, since changes were certainly missed) and `false` when the feed
    /// closed.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.table == self.collection => return true,
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return true,
                Err(RecvError::Closed) => return false,
            }
        }
    }

    /// Discard everything already queued; returns how many relevant events
    /// were dropped.
    pub fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.table == self.collection => drained += 1,
                Ok(_) => {}
                Err(TryRecvError::Lagged(_)) => drained += 1,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return drained,
            }
        }
    }
}
