//! farm_sync server
//!
//! Opens the sled store, starts the dashboard aggregate store on top of it and
//! serves the REST API until ctrl-c.
//!
//! Usage:
//!   cargo run --bin farm_sync                 # serve on 0.0.0.0:11111
//!   FARM_SYNC_ADDR=127.0.0.1:8080 cargo run   # or anything from .env
//!   cargo run --bin farm-cli -- dashboard     # talk to it

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use farm_sync::config::Config;
use farm_sync::rest::create_router;
use farm_sync::storage::Storage;
use farm_sync::store::FarmData;
use farm_sync::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    // Keep the guard alive so buffered file logs get flushed on exit.
    let _log_guard = telemetry::init(&config);

    info!(
        addr = %config.addr,
        data_dir = %config.data_dir.display(),
        "farm_sync starting"
    );

    let storage = Storage::open(&config.data_dir)?;
    let data = Arc::new(FarmData::open(Arc::new(storage.clone())).await);
    let state = data.state();
    info!(
        phase = ?state.phase,
        users = state.data.users.len(),
        fields = state.data.fields.len(),
        tasks = state.data.tasks.len(),
        "dashboard loaded"
    );

    let app = create_router(Arc::clone(&data));
    let listener = TcpListener::bind(config.addr).await?;
    info!(addr = %config.addr, "REST API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    data.dispose();
    if let Err(e) = storage.flush() {
        error!(error = %e, "final flush failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
