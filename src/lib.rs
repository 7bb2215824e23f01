//! # changefeed
//! Lease-based change feed processing with at-least-once delivery.
//!
//! A change feed is a set of partitions, each an ordered log of JSON
//! records. Any number of hosts can consume the same feed: every partition
//! has a *lease* in a shared lease store, and only the host holding a live
//! lease reads that partition. Leases carry the continuation token of the
//! last batch the handler accepted, so a partition that changes hands
//! resumes where the previous owner stopped.
//!
//! ## Components
//! - [`store`]: the [`LeaseStore`](store::LeaseStore) and
//!   [`FeedSource`](store::FeedSource) seams, with an in-memory backend and
//!   one on top of [`object_store`]
//! - [`processor`]: discovery, lease management, feed reading, dispatch and
//!   the [`ChangeFeedProcessor`](processor::ChangeFeedProcessor) lifecycle
//! - [`config`], [`error`], [`metrics`], [`retry`], [`telemetry`]: ambient
//!   plumbing
//!
//! ## Getting started
//! ```rust,no_run
//! use std::sync::Arc;
//! use changefeed::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let backend = Arc::new(ObjectStoreBackend::from_config(&StoreConfig::from_env()?)?);
//!     backend.ensure_containers().await?;
//!
//!     let handler = handler_fn(|batch: ChangeBatch| async move {
//!         tracing::info!("RECEIVED {} RECORDS", batch.len());
//!         Ok::<(), HandlerError>(())
//!     });
//!
//!     let processor = ChangeFeedProcessor::new(
//!         ProcessorConfig::from_env()?,
//!         backend.clone(),
//!         backend,
//!         Arc::new(handler),
//!     );
//!     processor
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Delivery guarantees
//! - Batches of one partition are handled one at a time, in log order.
//! - The checkpoint moves only after the handler returned `Ok`, so after a
//!   failure or an ownership change the same records may be handled again.
//! - A record is never skipped.

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Types needed to run a processor.
    pub use crate::config::{ObjectStoreType, ProcessorConfig, StoreConfig};
    pub use crate::error::{Error, HandlerError, Result};
    pub use crate::processor::{
        ChangeFeedProcessor, ChangeHandler, ProcessorState, handler_fn,
    };
    pub use crate::store::{FeedSource, FeedWriter, InMemoryStore, LeaseStore, ObjectStoreBackend};
    pub use crate::telemetry::{LogFormat, init_logging};
    pub use crate::types::{ChangeBatch, ChangeRecord, ContinuationToken, Lease, PartitionId};
}
