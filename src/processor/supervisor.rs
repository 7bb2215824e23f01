//! Supervision of partition worker tasks.
//!
//! `WorkerRegistry` owns one task per partition together with the child
//! cancellation token that stops it. The controller:
//!
//! - spawns a worker when it acquires a partition
//! - cancels a single worker when its lease is lost
//! - reaps finished workers and classifies why they stopped
//! - shuts everything down with a deadline, aborting stragglers

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::types::PartitionId;

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Cancelled by the controller.
    Stopped,
    /// Another host owns the partition now.
    LeaseLost,
    /// The feed could not be read; worth restarting after a cooldown.
    TransientReadFailure(String),
    /// The handler kept failing on the same batch.
    HandlerFailure(String),
    /// Any other error, or a panic.
    Failed(String),
}

impl WorkerExit {
    fn from_join(result: std::result::Result<Result<()>, JoinError>) -> Self {
        match result {
            Ok(Ok(())) => WorkerExit::Stopped,
            Ok(Err(Error::LeaseLost { .. })) => WorkerExit::LeaseLost,
            Ok(Err(e @ Error::TransientReadFailure { .. })) => {
                WorkerExit::TransientReadFailure(e.to_string())
            }
            Ok(Err(e @ Error::HandlerFailure { .. })) => WorkerExit::HandlerFailure(e.to_string()),
            Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
            Err(e) if e.is_cancelled() => WorkerExit::Stopped,
            Err(e) => WorkerExit::Failed(format!("worker panicked: {}", e)),
        }
    }

    pub fn as_metric_label(&self) -> &'static str {
        match self {
            WorkerExit::Stopped => "stopped",
            WorkerExit::LeaseLost => "lease_lost",
            WorkerExit::TransientReadFailure(_) => "transient_read",
            WorkerExit::HandlerFailure(_) => "handler",
            WorkerExit::Failed(_) => "failed",
        }
    }
}

struct WorkerEntry {
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
}

pub struct WorkerRegistry {
    /// Parent of every worker token; cancelling it stops all workers.
    root: CancellationToken,
    workers: HashMap<PartitionId, WorkerEntry>,
    shutting_down: bool,
}

impl WorkerRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            workers: HashMap::new(),
            shutting_down: false,
        }
    }

    /// Spawn the worker for `partition`.
    ///
    /// `start` receives the worker's cancellation token. Ignored during
    /// shutdown or while the partition's previous worker is still
    /// registered, running or not yet reaped.
    pub fn spawn<F, Fut>(&mut self, partition: PartitionId, start: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.shutting_down {
            warn!(partition = %partition, "Ignoring worker spawn during shutdown");
            return false;
        }
        if self.workers.contains_key(&partition) {
            debug!(partition = %partition, "Worker already registered");
            return false;
        }

        let cancel = self.root.child_token();
        let handle = tokio::spawn(start(cancel.clone()));
        self.workers.insert(
            partition,
            WorkerEntry { handle, cancel },
        );
        true
    }

    pub fn is_running(&self, partition: &PartitionId) -> bool {
        self.workers
            .get(partition)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    pub fn running_partitions(&self) -> Vec<PartitionId> {
        let mut running: Vec<PartitionId> = self
            .workers
            .iter()
            .filter(|(_, entry)| !entry.handle.is_finished())
            .map(|(p, _)| p.clone())
            .collect();
        running.sort();
        running
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Ask one worker to stop. It is reaped once it exits.
    pub fn cancel(&self, partition: &PartitionId) {
        if let Some(entry) = self.workers.get(partition) {
            entry.cancel.cancel();
        }
    }

    /// Collect every worker that has exited, with the reason.
    pub async fn reap_finished(&mut self) -> Vec<(PartitionId, WorkerExit)> {
        let finished: Vec<PartitionId> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.handle.is_finished())
            .map(|(p, _)| p.clone())
            .collect();

        let mut exits = Vec::with_capacity(finished.len());
        for partition in finished {
            if let Some(entry) = self.workers.remove(&partition) {
                let exit = WorkerExit::from_join(entry.handle.await);
                metrics::record_worker_exit(exit.as_metric_label());
                exits.push((partition, exit));
            }
        }
        exits
    }

    /// Cancel all workers and wait for them, aborting those still running
    /// when `timeout` elapses.
    pub async fn shutdown_with_timeout(&mut self, timeout: Duration) -> Vec<(PartitionId, WorkerExit)> {
        if self.shutting_down {
            return Vec::new();
        }
        self.shutting_down = true;

        info!(worker_count = self.workers.len(), "Stopping partition workers");
        self.root.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut exits = Vec::with_capacity(self.workers.len());

        for (partition, entry) in self.workers.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let mut handle = entry.handle;
            let exit = match tokio::time::timeout(remaining, &mut handle).await {
                Ok(result) => WorkerExit::from_join(result),
                Err(_) => {
                    warn!(partition = %partition, "Worker did not stop in time, aborting");
                    handle.abort();
                    WorkerExit::Stopped
                }
            };
            metrics::record_worker_exit(exit.as_metric_label());
            exits.push((partition, exit));
        }

        info!("All partition workers stopped");
        exits
    }
}
