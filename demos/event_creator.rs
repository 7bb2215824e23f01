//! Seeds the events container with sample records.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example event_creator
//! ```
//!
//! Writes 300 records with ids `COSMO-001-0001` to `COSMO-001-0300` into the
//! store described by the environment (see `StoreConfig::from_env`),
//! creating the database and containers first if needed. Run
//! `event_processor` against the same `DATA_PATH` to consume them.

use std::time::Duration;

use changefeed::config::StoreConfig;
use changefeed::store::{FeedWriter, ObjectStoreBackend};
use changefeed::telemetry::{LogFormat, init_logging};
use serde_json::json;
use tracing::info;

const ID_PREFIX: &str = "COSMO-001-";
const EVENT_COUNT: usize = 300;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = StoreConfig::from_env()?;
    let backend = ObjectStoreBackend::from_config(&config)?;
    backend.ensure_containers().await?;

    for i in 1..=EVENT_COUNT {
        let id = format!("{}{:04}", ID_PREFIX, i);
        let record = tokio::time::timeout(WRITE_TIMEOUT, backend.append(json!({ "id": id })))
            .await
            .map_err(|_| format!("timed out creating event {}", id))??;
        info!(
            id = %record.id,
            lsn = record.lsn,
            "Created event {}",
            record.id
        );
    }

    info!(count = EVENT_COUNT, database = %config.database, "Seeding complete");
    Ok(())
}
