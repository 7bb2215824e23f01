//! Runs a change feed processor over the events container.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example event_processor
//! ```
//!
//! Several hosts sharing one store split the partitions between them:
//! ```bash
//! HOST_NAME=host-a cargo run --example event_processor
//! HOST_NAME=host-b cargo run --example event_processor
//! ```
//!
//! With JSON logging:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=changefeed=debug,info cargo run --example event_processor
//! ```
//!
//! Press Ctrl-C to stop; leases are released before the process exits.

use std::sync::Arc;

use changefeed::config::{ProcessorConfig, StoreConfig};
use changefeed::error::HandlerError;
use changefeed::metrics;
use changefeed::processor::{ChangeFeedProcessor, handler_fn};
use changefeed::store::ObjectStoreBackend;
use changefeed::telemetry::{LogFormat, init_logging};
use changefeed::types::ChangeBatch;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;
    metrics::init_metrics();

    let store_config = StoreConfig::from_env()?;
    let processor_config = ProcessorConfig::from_env()?;

    let backend = Arc::new(ObjectStoreBackend::from_config(&store_config)?);
    backend.ensure_containers().await?;

    let handler = handler_fn(|batch: ChangeBatch| async move {
        info!("RECEIVED {} RECORDS", batch.len());
        for record in &batch.records {
            debug!(partition = %batch.partition, lsn = record.lsn, id = %record.id, "Record");
        }
        Ok::<(), HandlerError>(())
    });

    let processor = ChangeFeedProcessor::new(
        processor_config,
        backend.clone(),
        backend,
        Arc::new(handler),
    );

    processor
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;

    match metrics::encode_metrics() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
    Ok(())
}
