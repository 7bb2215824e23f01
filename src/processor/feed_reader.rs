//! Long-polling reader of one partition's change stream.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::with_store_policy;
use crate::store::FeedSource;
use crate::types::{ChangeBatch, ContinuationToken, PartitionId};

const FEED_POLICY: &str = "feed_read";

pub struct FeedReader {
    feed: Arc<dyn FeedSource>,
    partition: PartitionId,
    max_item_count: usize,
    poll_interval: Duration,
}

impl FeedReader {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        partition: PartitionId,
        max_item_count: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            feed,
            partition,
            max_item_count,
            poll_interval,
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    /// Next batch after `token`.
    ///
    /// Returns immediately when records are available. Otherwise waits up to
    /// the poll interval for new changes and reads once more; a batch that is
    /// still empty carries `token` unchanged. Cancellation ends the wait early
    /// with an empty batch.
    ///
    /// # Errors
    ///
    /// [`Error::TransientReadFailure`] once the store retry policy gives up.
    pub async fn next_batch(
        &self,
        token: ContinuationToken,
        cancel: &CancellationToken,
    ) -> Result<ChangeBatch> {
        let batch = self.read(token).await?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(ChangeBatch::empty(self.partition.clone(), token));
            }
            _ = self.feed.wait_for_changes(&self.partition, token, self.poll_interval) => {}
        }

        if cancel.is_cancelled() {
            return Ok(ChangeBatch::empty(self.partition.clone(), token));
        }
        self.read(token).await
    }

    async fn read(&self, token: ContinuationToken) -> Result<ChangeBatch> {
        let records = with_store_policy(FEED_POLICY, || {
            self.feed.read(&self.partition, token, self.max_item_count)
        })
        .await
        .map_err(|e| match e {
            e if e.is_retriable() => Error::TransientReadFailure {
                partition: self.partition.clone(),
                message: e.to_string(),
            },
            e => e,
        })?;

        if !records.is_empty() {
            debug!(
                partition = %self.partition,
                count = records.len(),
                from = %token,
                "Read change batch"
            );
        }
        Ok(ChangeBatch::from_records(self.partition.clone(), records, token))
    }
}
