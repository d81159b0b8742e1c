//! Query client: parameterized reads of one collection, and live queries
//! that re-run themselves whenever that collection changes.
//!
//! E.g. `SELECT * FROM tasks WHERE status = 'pending' ORDER BY due_date ASC`
//! is `QueryOptions::new().filter("status", "pending").order("due_date", true)`.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::schema::Collection;
use crate::storage::CollectionStore;

/// Filter / order / limit / projection for one read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub filter_column: Option<String>,
    #[serde(default)]
    pub filter_value: Option<Value>,
    #[serde(default)]
    pub order_by: Option<String>,
    /// Only meaningful with `order_by`; unset means descending.
    #[serde(default)]
    pub ascending: Option<bool>,
    /// `Some(0)` reads everything, same as `None`.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Comma-separated column list, or `*`.
    #[serde(default)]
    pub select: Option<String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter_column = Some(column.into());
        self.filter_value = Some(value.into());
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some(column.into());
        self.ascending = Some(ascending);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    /// Columns named by `select`, or `None` for every column.
    pub fn projection(&self) -> Option<Vec<String>> {
        let raw = self.select.as_deref()?.trim();
        if raw.is_empty() || raw == "*" {
            return None;
        }
        let columns: Vec<String> = raw
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        (!columns.is_empty()).then_some(columns)
    }

    /// Run the options over rows already in insertion order:
    /// WHERE, then ORDER BY (stable), then LIMIT, then the column list.
    pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = match (&self.filter_column, &self.filter_value) {
            (Some(column), Some(value)) => rows
                .into_iter()
                .filter(|row| column_equals(row, column, value))
                .collect(),
            _ => rows,
        };

        if let Some(column) = &self.order_by {
            let ascending = self.ascending.unwrap_or(false);
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(column.as_str()), b.get(column.as_str()));
                if ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }

        if let Some(limit) = self.limit.filter(|n| *n > 0) {
            rows.truncate(limit);
        }

        match self.projection() {
            Some(columns) => rows.into_iter().map(|row| project(row, &columns)).collect(),
            None => rows,
        }
    }
}

/// SQL-style `column = value`: NULL never matches, and a text filter matches
/// numbers and booleans with the same spelling (values arriving from a URL
/// are always text).
pub fn column_equals(row: &Value, column: &str, value: &Value) -> bool {
    let Some(actual) = row.get(column) else {
        return false;
    };
    if actual.is_null() || value.is_null() {
        return false;
    }
    if actual == value {
        return true;
    }
    match (actual, value) {
        (Value::Number(n), Value::String(s)) => {
            n.to_string() == *s || s.parse::<f64>().ok() == n.as_f64()
        }
        (Value::Bool(b), Value::String(s)) => b.to_string() == *s,
        _ => false,
    }
}

/// Total order used by ORDER BY. Missing and NULL sort after everything,
/// so they come last ascending and first descending.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .unwrap_or(0.0)
                .partial_cmp(&y.as_f64().unwrap_or(0.0))
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 5,
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
    }
}

fn project(row: Value, columns: &[String]) -> Value {
    match row {
        Value::Object(mut map) => {
            let mut out = Map::new();
            for column in columns {
                if let Some(v) = map.remove(column) {
                    out.insert(column.clone(), v);
                }
            }
            Value::Object(out)
        }
        other => other,
    }
}

/// Decode rows into `T`. A row that does not fit is skipped with a warning.
pub fn decode_rows<T: DeserializeOwned>(collection: Collection, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.get("id").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<T>(row) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(collection = %collection, id = %id, error = %e, "skipping undecodable row");
                    None
                }
            }
        })
        .collect()
}

/// One read, decoded.
pub async fn fetch<T: DeserializeOwned>(
    store: &dyn CollectionStore,
    collection: Collection,
    options: &QueryOptions,
) -> Result<Vec<T>> {
    let rows = store.select(collection, options).await?;
    debug!(collection = %collection, rows = rows.len(), "query fetched");
    Ok(decode_rows(collection, rows))
}

/// First row of the read, or `None` when there is nothing there yet. An
/// empty collection is a valid state; only real failures are errors.
pub async fn fetch_one<T: DeserializeOwned>(
    store: &dyn CollectionStore,
    collection: Collection,
    options: &QueryOptions,
) -> Result<Option<T>> {
    let options = options.clone().limit(1);
    Ok(fetch(store, collection, &options).await?.into_iter().next())
}

pub async fn fetch_by_id<T: DeserializeOwned>(
    store: &dyn CollectionStore,
    collection: Collection,
    id: &str,
) -> Result<T> {
    let options = QueryOptions::new().filter("id", id).limit(1);
    let row = store
        .select(collection, &options)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::not_found(collection.table(), id))?;
    // a malformed row is an error here, not a skip
    Ok(serde_json::from_value(row)?)
}

/// What a live query exposes to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// `None` until the first successful read.
    pub data: Option<Vec<T>>,
    pub loading: bool,
    pub error: Option<String>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            loading: true,
            error: None,
        }
    }
}

/// A read that keeps itself fresh.
///
/// Opening it subscribes to the collection's change feed and spawns a task
/// that reads once, then re-reads (replacing `data` wholesale) after every
/// change. A failed read sets `error` and leaves the previous `data` in
/// place. Dropping or closing the query unsubscribes.
pub struct LiveQuery<T> {
    collection: Collection,
    state: watch::Receiver<QueryState<T>>,
    task: Option<JoinHandle<()>>,
}

impl<T> LiveQuery<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn open(store: Arc<dyn CollectionStore>, collection: Collection, options: QueryOptions) -> Self {
        let (tx, rx) = watch::channel(QueryState::default());
        let mut subscription = store.subscribe(collection);

        let task = tokio::spawn(async move {
            run_query(store.as_ref(), collection, &options, &tx).await;
            while subscription.changed().await {
                let coalesced = subscription.drain_pending();
                debug!(collection = %collection, coalesced, "change received, re-running query");
                run_query(store.as_ref(), collection, &options, &tx).await;
            }
            debug!(collection = %collection, "change feed closed, live query stopped");
        });

        Self {
            collection,
            state: rx,
            task: Some(task),
        }
    }

    pub fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    pub fn data(&self) -> Option<Vec<T>> {
        self.state.borrow().data.clone()
    }

    /// Wait for the next state change. `false` once the query has stopped.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }

    /// Wait until the state satisfies `pred`. `None` if the query stops first.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<QueryState<T>>
    where
        F: FnMut(&QueryState<T>) -> bool,
    {
        loop {
            {
                let current = self.state.borrow_and_update();
                if pred(&current) {
                    return Some(current.clone());
                }
            }
            if self.state.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl<T> LiveQuery<T> {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Stop listening. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_query<T: DeserializeOwned>(
    store: &dyn CollectionStore,
    collection: Collection,
    options: &QueryOptions,
    tx: &watch::Sender<QueryState<T>>,
) {
    tx.send_modify(|state| state.loading = true);
    let result = fetch::<T>(store, collection, options).await;
    tx.send_modify(|state| {
        state.loading = false;
        match result {
            Ok(rows) => {
                state.data = Some(rows);
                state.error = None;
            }
            Err(e) => {
                warn!(collection = %collection, error = %e, "live query read failed, keeping previous data");
                state.error = Some(e.to_string());
            }
        }
    });
}

/// The dashboard's stock reads.
pub mod presets {
    use super::QueryOptions;
    use crate::models::TaskStatus;

    pub fn users() -> QueryOptions {
        QueryOptions::new().order("date_added", false)
    }

    pub fn fields() -> QueryOptions {
        QueryOptions::new().order("name", true)
    }

    /// `None` reads every status.
    pub fn tasks(status: Option<TaskStatus>) -> QueryOptions {
        let options = QueryOptions::new().order("due_date", true);
        match status {
            Some(status) => options.filter("status", status.as_str()),
            None => options,
        }
    }

    pub fn notifications(user_id: Option<&str>) -> QueryOptions {
        let options = QueryOptions::new().order("time", false);
        match user_id {
            Some(user_id) => options.filter("user_id", user_id),
            None => options,
        }
    }

    pub fn latest_weather() -> QueryOptions {
        QueryOptions::new().order("recorded_at", false).limit(1)
    }

    pub fn diagnostic_results() -> QueryOptions {
        QueryOptions::new().order("timestamp", false)
    }

    /// Latest reading for one field, or every reading newest first.
    pub fn soil_data(field_id: Option<&str>) -> QueryOptions {
        let options = QueryOptions::new().order("recorded_at", false);
        match field_id {
            Some(field_id) => options.filter("field_id", field_id).limit(1),
            None => options,
        }
    }

    pub fn crop_history(field_id: Option<&str>) -> QueryOptions {
        let options = QueryOptions::new().order("year", false);
        match field_id {
            Some(field_id) => options.filter("field_id", field_id),
            None => options,
        }
    }
}
