use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionResult,
};
use sled::{Db, Transactional, Tree};
use tracing::debug;
use uuid::Uuid;

use crate::changes::{ChangeEvent, ChangeFeed, ChangeKind, Subscription};
use crate::error::{Result, SyncError};
use crate::query::{column_equals, QueryOptions};
use crate::schema::Collection;

/// Row-level API of the backing collection store.
///
/// Every successful write publishes a change event for its collection.
/// Callers (query client, aggregate store) only see this trait, so a remote
/// store or a test double can stand in for [`Storage`].
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// `SELECT [cols] FROM t [WHERE c = v] [ORDER BY c] [LIMIT n]`
    async fn select(&self, collection: Collection, options: &QueryOptions) -> Result<Vec<Value>>;

    /// `INSERT ... RETURNING *`. Fills id and column defaults.
    async fn insert(&self, collection: Collection, row: Value) -> Result<Value>;

    /// `UPDATE ... SET <patch> WHERE id = <id> RETURNING *`
    async fn update(&self, collection: Collection, id: &str, patch: Value) -> Result<Value>;

    /// `UPDATE ... SET <patch> WHERE <column> = <value>`, returning the row count.
    async fn update_where(
        &self,
        collection: Collection,
        column: &str,
        value: &Value,
        patch: Value,
    ) -> Result<usize>;

    /// `DELETE ... WHERE id = <id>`, returning the removed row.
    async fn delete(&self, collection: Collection, id: &str) -> Result<Value>;

    /// `DELETE FROM t; INSERT ...` as one all-or-nothing write, returning the
    /// inserted rows.
    async fn replace_all(&self, collection: Collection, rows: Vec<Value>) -> Result<Vec<Value>>;

    fn subscribe(&self, collection: Collection) -> Subscription;
}

#[derive(Clone)]
struct Trees {
    /// sequence key (big-endian u64, insertion order) -> JSON row
    rows: Tree,
    /// id -> sequence key
    ids: Tree,
}

/// Sled-backed collection store.
///
/// Each collection gets a row tree keyed by a monotonically increasing
/// sequence, so plain scans come back in insertion order, and an id index
/// tree next to it. Clones share the same database and change feed.
#[derive(Clone)]
pub struct Storage {
    db: Db,
    trees: Arc<HashMap<Collection, Trees>>,
    feed: ChangeFeed,
}

impl Storage {
    /// Open or create the Sled database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// In-memory database, removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self> {
        let mut trees = HashMap::new();
        for collection in Collection::ALL {
            let rows = db.open_tree(collection.table())?;
            let ids = db.open_tree(format!("{}.ids", collection.table()))?;
            trees.insert(collection, Trees { rows, ids });
        }
        Ok(Self {
            db,
            trees: Arc::new(trees),
            feed: ChangeFeed::default(),
        })
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn len(&self, collection: Collection) -> usize {
        self.trees(collection).ids.len()
    }

    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    fn trees(&self, collection: Collection) -> &Trees {
        // every collection gets its trees in with_db
        &self.trees[&collection]
    }

    /// All rows in insertion order.
    pub fn scan(&self, collection: Collection) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        for item in self.trees(collection).rows.iter() {
            let (_, bytes) = item?;
            rows.push(serde_json::from_slice(&bytes)?);
        }
        Ok(rows)
    }

    fn insert_row(&self, collection: Collection, row: Value) -> Result<Value> {
        let row = prepare_insert(collection, row, &now_stamp())?;
        let id = row_id(&row).to_string();
        let key = self.db.generate_id()?.to_be_bytes();
        let encoded = serde_json::to_vec(&row)?;

        let trees = self.trees(collection);
        let outcome = (&trees.rows, &trees.ids).transaction(|(rows, ids)| -> TxResult<_> {
            if ids.get(id.as_bytes())?.is_some() {
                return abort(SyncError::Conflict {
                    collection: collection.table().to_string(),
                    id: id.clone(),
                });
            }
            ids.insert(id.as_bytes(), &key[..])?;
            rows.insert(&key[..], encoded.clone())?;
            Ok(())
        });
        settle(outcome)?;

        debug!(collection = %collection, id = %id, "row inserted");
        self.publish(ChangeKind::Insert, collection, &row);
        Ok(row)
    }

    fn update_row(&self, collection: Collection, id: &str, patch: Value) -> Result<Value> {
        let mut patch = into_object(collection, patch)?;
        match patch.remove("id") {
            None => {}
            Some(Value::String(ref same)) if same == id => {}
            Some(_) => return Err(SyncError::invalid("the id column cannot be changed")),
        }
        let now = now_stamp();
        let trees = self.trees(collection);
        // Index lookup and row write commit together, so a concurrent delete
        // either wins outright or sees the updated row.
        let outcome = (&trees.rows, &trees.ids).transaction(|(rows, ids)| -> TxResult<_> {
            let Some(key) = ids.get(id.as_bytes())? else {
                return abort(SyncError::not_found(collection.table(), id));
            };
            let Some(bytes) = rows.get(&key)? else {
                return abort(SyncError::not_found(collection.table(), id));
            };
            let current: Value = serde_json::from_slice(&bytes).or_else(abort_with)?;
            let row = apply_patch(collection, current, &patch, &now);
            rows.insert(key, serde_json::to_vec(&row).or_else(abort_with)?)?;
            Ok(row)
        });
        let row = settle(outcome)?;
        self.publish(ChangeKind::Update, collection, &row);
        Ok(row)
    }

    fn update_rows_where(
        &self,
        collection: Collection,
        column: &str,
        value: &Value,
        patch: Value,
    ) -> Result<usize> {
        let patch = into_object(collection, patch)?;
        if patch.contains_key("id") {
            return Err(SyncError::invalid("the id column cannot be changed"));
        }
        let mut keys = Vec::new();
        for item in self.trees(collection).rows.iter() {
            let (key, bytes) = item?;
            let row: Value = serde_json::from_slice(&bytes)?;
            if column_equals(&row, column, value) {
                keys.push(key);
            }
        }

        let now = now_stamp();
        let rows_tree = &self.trees(collection).rows;
        let mut count = 0;
        for key in keys {
            // re-read under the transaction; the row may be gone or changed
            let outcome = rows_tree.transaction(|rows| -> TxResult<_> {
                let Some(bytes) = rows.get(&key)? else {
                    return Ok(None);
                };
                let current: Value = serde_json::from_slice(&bytes).or_else(abort_with)?;
                if !column_equals(&current, column, value) {
                    return Ok(None);
                }
                let row = apply_patch(collection, current, &patch, &now);
                rows.insert(key.clone(), serde_json::to_vec(&row).or_else(abort_with)?)?;
                Ok(Some(row))
            });
            if let Some(row) = settle(outcome)? {
                count += 1;
                self.publish(ChangeKind::Update, collection, &row);
            }
        }
        Ok(count)
    }

    fn delete_row(&self, collection: Collection, id: &str) -> Result<Value> {
        let trees = self.trees(collection);
        let outcome = (&trees.rows, &trees.ids).transaction(|(rows, ids)| -> TxResult<_> {
            let Some(key) = ids.remove(id.as_bytes())? else {
                return abort(SyncError::not_found(collection.table(), id));
            };
            let Some(bytes) = rows.remove(key)? else {
                return abort(SyncError::not_found(collection.table(), id));
            };
            serde_json::from_slice::<Value>(&bytes).or_else(abort_with)
        });
        let row = settle(outcome)?;
        debug!(collection = %collection, id = %id, "row deleted");
        self.publish(ChangeKind::Delete, collection, &row);
        Ok(row)
    }

    /// Swap the whole contents of `collection` for `rows` in one transaction.
    /// Every row is prepared before anything is written; any failure leaves
    /// the collection as it was.
    fn replace_rows(&self, collection: Collection, rows: Vec<Value>) -> Result<Vec<Value>> {
        let now = now_stamp();
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            let row = prepare_insert(collection, row, &now)?;
            let key = self.db.generate_id()?.to_be_bytes();
            let encoded = serde_json::to_vec(&row)?;
            fresh.push((key, row, encoded));
        }

        let trees = self.trees(collection);
        let mut existing = Vec::new();
        for item in trees.ids.iter() {
            let (id, key) = item?;
            existing.push((id, key));
        }

        let outcome = (&trees.rows, &trees.ids).transaction(|(rows, ids)| -> TxResult<_> {
            let mut removed = Vec::new();
            for (id, key) in &existing {
                ids.remove(id.clone())?;
                if let Some(bytes) = rows.remove(key.clone())? {
                    removed.push(serde_json::from_slice::<Value>(&bytes).or_else(abort_with)?);
                }
            }
            for (key, row, encoded) in &fresh {
                let id = row_id(row);
                if ids.get(id.as_bytes())?.is_some() {
                    return abort(SyncError::Conflict {
                        collection: collection.table().to_string(),
                        id: id.to_string(),
                    });
                }
                ids.insert(id.as_bytes(), &key[..])?;
                rows.insert(&key[..], encoded.clone())?;
            }
            Ok(removed)
        });
        let removed = settle(outcome)?;

        for row in &removed {
            self.publish(ChangeKind::Delete, collection, row);
        }
        let inserted: Vec<Value> = fresh.into_iter().map(|(_, row, _)| row).collect();
        for row in &inserted {
            self.publish(ChangeKind::Insert, collection, row);
        }
        debug!(
            collection = %collection,
            removed = removed.len(),
            inserted = inserted.len(),
            "collection replaced"
        );
        Ok(inserted)
    }

    fn publish(&self, kind: ChangeKind, collection: Collection, row: &Value) {
        self.feed.publish(ChangeEvent {
            event: kind,
            table: collection,
            record: row.clone(),
        });
    }
}

#[async_trait]
impl CollectionStore for Storage {
    async fn select(&self, collection: Collection, options: &QueryOptions) -> Result<Vec<Value>> {
        Ok(options.apply(self.scan(collection)?))
    }

    async fn insert(&self, collection: Collection, row: Value) -> Result<Value> {
        self.insert_row(collection, row)
    }

    async fn update(&self, collection: Collection, id: &str, patch: Value) -> Result<Value> {
        self.update_row(collection, id, patch)
    }

    async fn update_where(
        &self,
        collection: Collection,
        column: &str,
        value: &Value,
        patch: Value,
    ) -> Result<usize> {
        self.update_rows_where(collection, column, value, patch)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<Value> {
        self.delete_row(collection, id)
    }

    async fn replace_all(&self, collection: Collection, rows: Vec<Value>) -> Result<Vec<Value>> {
        self.replace_rows(collection, rows)
    }

    fn subscribe(&self, collection: Collection) -> Subscription {
        self.feed.subscribe(collection)
    }
}

/// Object check, id assignment and column defaults for a row about to be
/// inserted.
fn prepare_insert(collection: Collection, row: Value, now: &str) -> Result<Value> {
    let mut row = into_object(collection, row)?;
    match row.get("id") {
        None | Some(Value::Null) => {
            row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        Some(Value::String(id)) if !id.is_empty() => {}
        Some(_) => return Err(SyncError::invalid("id must be a non-empty string")),
    }
    collection.apply_defaults(&mut row, now);
    Ok(Value::Object(row))
}

/// Only for rows that went through [`prepare_insert`].
fn row_id(row: &Value) -> &str {
    row.get("id").and_then(Value::as_str).unwrap_or_default()
}

fn apply_patch(collection: Collection, current: Value, patch: &Map<String, Value>, now: &str) -> Value {
    let mut row = match current {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (column, value) in patch {
        row.insert(column.clone(), value.clone());
    }
    if collection.has_updated_at() && !patch.contains_key("updated_at") {
        row.insert("updated_at".to_string(), Value::String(now.to_string()));
    }
    Value::Object(row)
}

type TxResult<T> = ConflictableTransactionResult<T, SyncError>;

fn abort<T>(e: SyncError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(e))
}

fn abort_with<T, E: Into<SyncError>>(e: E) -> TxResult<T> {
    abort(e.into())
}

fn settle<T>(outcome: TransactionResult<T, SyncError>) -> Result<T> {
    outcome.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => SyncError::Storage(e),
    })
}

fn into_object(collection: Collection, value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::invalid(format!(
            "{} rows must be JSON objects, got {}",
            collection, other
        ))),
    }
}

/// RFC 3339 UTC with fixed precision, so stamps also sort as text.
pub fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
