//! farm_sync: data-sync layer for a farm operations dashboard
//!
//! Schema-fixed collections live in Sled as JSON rows; every write publishes a
//! change event. On top of that sit a query client (parameterized and live
//! reads of one collection) and an aggregate store that keeps the nine
//! dashboard collections fresh and passes mutations through.
//!
//! The server binary exposes it all over REST (Axum, port 11111).

pub mod changes;
pub mod config;
pub mod error;
pub mod models;
pub mod query;
// REST API module: Axum HTTP handlers on port 11111
pub mod rest;
pub mod schema;
pub mod storage;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;
