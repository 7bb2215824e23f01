//! Handler invocation and checkpointing.
//!
//! For every non-empty batch the dispatcher awaits the handler, then writes
//! the batch's continuation token into the lease. A failing handler gets the
//! same batch again under [`handler_policy`]; the token only moves after a
//! successful invocation, so a failure can cause duplicates but never loss.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use backon::Retryable;
use tracing::{debug, warn};

use super::lease_manager::LeaseManager;
use crate::error::{Error, HandlerError, Result};
use crate::metrics;
use crate::retry::{handler_policy, record_retry_attempt, record_retry_exhausted};
use crate::types::{ChangeBatch, ContinuationToken};

const HANDLER_POLICY: &str = "handler";

/// User callback receiving change batches.
///
/// Invoked at most once at a time per partition; batches of different
/// partitions may be handled concurrently.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, batch: &ChangeBatch) -> std::result::Result<(), HandlerError>;
}

/// [`ChangeHandler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Adapt an async closure into a [`ChangeHandler`].
///
/// ```rust
/// use changefeed::error::HandlerError;
/// use changefeed::processor::handler_fn;
///
/// let handler = handler_fn(|batch| async move {
///     tracing::info!("RECEIVED {} RECORDS", batch.len());
///     Ok::<(), HandlerError>(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ChangeBatch) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ChangeHandler for FnHandler<F>
where
    F: Fn(ChangeBatch) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, batch: &ChangeBatch) -> std::result::Result<(), HandlerError> {
        (self.f)(batch.clone()).await
    }
}

pub struct Dispatcher {
    handler: Arc<dyn ChangeHandler>,
    leases: Arc<LeaseManager>,
    max_retries: usize,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn ChangeHandler>, leases: Arc<LeaseManager>, max_retries: usize) -> Self {
        Self {
            handler,
            leases,
            max_retries,
        }
    }

    /// Deliver `batch` and checkpoint it, returning the new token.
    ///
    /// Empty batches are neither delivered nor checkpointed.
    ///
    /// # Errors
    ///
    /// - [`Error::HandlerFailure`] when the handler fails on every attempt;
    ///   the checkpoint is unchanged
    /// - [`Error::LeaseLost`] when the checkpoint finds another owner
    pub async fn dispatch(&self, batch: &ChangeBatch) -> Result<ContinuationToken> {
        if batch.is_empty() {
            return Ok(batch.continuation);
        }
        let partition = batch.partition.as_str();
        let mut attempts: u32 = 0;

        let outcome = (|| {
            attempts += 1;
            let handler = self.handler.clone();
            async move {
                let started = Instant::now();
                let result = handler.handle(batch).await;
                let elapsed = started.elapsed().as_secs_f64();
                match &result {
                    Ok(()) => metrics::record_delivery(partition, batch.len(), elapsed),
                    Err(_) => metrics::record_handler_failure(partition, elapsed),
                }
                result
            }
        })
        .retry(handler_policy(self.max_retries))
        .notify(|e, delay| {
            warn!(
                partition,
                error = %e,
                retry_in = ?delay,
                first_lsn = batch.first_lsn(),
                "Handler failed, redelivering batch"
            );
        })
        .await;

        if attempts > 1 {
            record_retry_attempt(HANDLER_POLICY, attempts - 1);
        }

        if let Err(e) = outcome {
            record_retry_exhausted(HANDLER_POLICY);
            return Err(Error::HandlerFailure {
                partition: batch.partition.clone(),
                attempts,
                message: e.to_string(),
            });
        }

        debug!(
            partition,
            count = batch.len(),
            attempts,
            continuation = %batch.continuation,
            "Batch handled"
        );
        self.leases
            .checkpoint(&batch.partition, batch.continuation)
            .await?;
        Ok(batch.continuation)
    }
}
