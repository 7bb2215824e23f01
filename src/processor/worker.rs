//! Per-partition pull loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::dispatcher::Dispatcher;
use super::feed_reader::FeedReader;
use super::lease_manager::LeaseManager;
use crate::error::{Error, Result};

/// Reads one partition from its checkpoint and hands batches to the
/// dispatcher until cancelled or a partition-level error occurs.
pub struct PartitionWorker {
    reader: FeedReader,
    dispatcher: Arc<Dispatcher>,
    leases: Arc<LeaseManager>,
}

impl PartitionWorker {
    pub fn new(reader: FeedReader, dispatcher: Arc<Dispatcher>, leases: Arc<LeaseManager>) -> Self {
        Self {
            reader,
            dispatcher,
            leases,
        }
    }

    /// Run until `cancel` fires (`Ok`) or the partition fails (`Err`).
    ///
    /// Cancellation is observed between batches: a batch already read is
    /// still delivered and checkpointed.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let partition = self.reader.partition().clone();
        let mut token = self
            .leases
            .continuation(&partition)
            .await
            .ok_or_else(|| Error::LeaseLost {
                partition: partition.clone(),
            })?;

        info!(partition = %partition, continuation = %token, "Partition worker started");

        while !cancel.is_cancelled() {
            let batch = self.reader.next_batch(token, &cancel).await?;
            if batch.is_empty() {
                continue;
            }
            token = self.dispatcher.dispatch(&batch).await?;
        }

        debug!(partition = %partition, continuation = %token, "Partition worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::error::HandlerError;
    use crate::processor::dispatcher::handler_fn;
    use crate::store::{InMemoryStore, LeaseStore};
    use crate::types::{ChangeBatch, ContinuationToken, Lease, PartitionId};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn setup(store: &InMemoryStore) -> Arc<LeaseManager> {
        let config = Arc::new(ProcessorConfig::default().with_lease_prefix("w"));
        let leases = Arc::new(LeaseManager::new(Arc::new(store.clone()), config));
        let lease = store
            .create(&Lease::new("w", PartitionId::from("0"), ContinuationToken::BEGINNING))
            .await
            .unwrap()
            .unwrap();
        leases.acquire(&lease).await.unwrap().unwrap();
        leases
    }

    fn reader(store: &InMemoryStore) -> FeedReader {
        FeedReader::new(
            Arc::new(store.clone()),
            PartitionId::from("0"),
            2,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_runs_until_cancelled_and_checkpoints() {
        let store = InMemoryStore::new(1);
        for i in 0..5 {
            store
                .append_to(&PartitionId::from("0"), &format!("r{}", i), serde_json::json!({}))
                .await
                .unwrap();
        }
        let leases = setup(&store).await;
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = sizes.clone();
        let handler = handler_fn(move |batch: ChangeBatch| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(batch.len());
                Ok::<(), HandlerError>(())
            }
        });
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(handler), leases.clone(), 0));
        let worker = PartitionWorker::new(reader(&store), dispatcher, leases.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(*sizes.lock().unwrap(), vec![2, 2, 1]);
        let stored = store.get("w..0").await.unwrap().unwrap();
        assert_eq!(stored.continuation, ContinuationToken::after(5));
    }

    #[tokio::test]
    async fn test_unowned_partition_is_lease_lost() {
        let store = InMemoryStore::new(1);
        let config = Arc::new(ProcessorConfig::default().with_lease_prefix("w"));
        let leases = Arc::new(LeaseManager::new(Arc::new(store.clone()), config));
        let handler = handler_fn(|_batch: ChangeBatch| async { Ok::<(), HandlerError>(()) });
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(handler), leases.clone(), 0));
        let worker = PartitionWorker::new(reader(&store), dispatcher, leases);

        let err = worker.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_handler_failure_ends_worker() {
        let store = InMemoryStore::new(1);
        store
            .append_to(&PartitionId::from("0"), "bad", serde_json::json!({}))
            .await
            .unwrap();
        let leases = setup(&store).await;
        let handler = handler_fn(|_batch: ChangeBatch| async { Err::<(), HandlerError>("nope".into()) });
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(handler), leases.clone(), 0));
        let worker = PartitionWorker::new(reader(&store), dispatcher, leases);

        let err = worker.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::HandlerFailure { attempts: 1, .. }));
    }
}
