//! Test double shared by the query and store tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::changes::Subscription;
use crate::error::{Result, SyncError};
use crate::query::QueryOptions;
use crate::schema::Collection;
use crate::storage::{CollectionStore, Storage};

/// Wraps [`Storage`] with per-collection read failures and a read delay.
pub(crate) struct FlakyStore {
    inner: Storage,
    failing: Mutex<HashSet<Collection>>,
    read_delay: Duration,
}

impl FlakyStore {
    pub(crate) fn new(inner: Storage, read_delay: Duration) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            read_delay,
        }
    }

    pub(crate) fn fail(&self, collection: Collection, on: bool) {
        let mut failing = self.failing.lock().unwrap();
        if on {
            failing.insert(collection);
        } else {
            failing.remove(&collection);
        }
    }
}

#[async_trait]
impl CollectionStore for FlakyStore {
    async fn select(&self, collection: Collection, options: &QueryOptions) -> Result<Vec<Value>> {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        if self.failing.lock().unwrap().contains(&collection) {
            return Err(SyncError::Unavailable(format!("{} is down", collection)));
        }
        self.inner.select(collection, options).await
    }

    async fn insert(&self, collection: Collection, row: Value) -> Result<Value> {
        self.inner.insert(collection, row).await
    }

    async fn update(&self, collection: Collection, id: &str, patch: Value) -> Result<Value> {
        self.inner.update(collection, id, patch).await
    }

    async fn update_where(
        &self,
        collection: Collection,
        column: &str,
        value: &Value,
        patch: Value,
    ) -> Result<usize> {
        self.inner.update_where(collection, column, value, patch).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<Value> {
        self.inner.delete(collection, id).await
    }

    async fn replace_all(&self, collection: Collection, rows: Vec<Value>) -> Result<Vec<Value>> {
        self.inner.replace_all(collection, rows).await
    }

    fn subscribe(&self, collection: Collection) -> Subscription {
        self.inner.subscribe(collection)
    }
}
