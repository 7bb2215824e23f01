//! Processor lifecycle and background loops.
//!
//! # State machine
//!
//! ```text
//! Stopped ──start()──► Starting ──probe + first acquisition──► Running
//!    ▲                    │ (failure)                            │
//!    └────────────────────┘                                 stop()
//!    ▲                                                           │
//!    └──────── workers drained, leases released ◄── Stopping ◄───┘
//! ```
//!
//! # Background tasks
//!
//! | Task | Interval | Work |
//! |------|----------|------|
//! | renewal | `lease_renew_interval` ± 15% | renew owned leases, cancel workers of lost ones |
//! | acquisition | `lease_acquire_interval` ± 15% | reap worker exits, discover, balance, acquire, spawn |
//! | worker (per partition) | continuous | read → handle → checkpoint |
//!
//! Every task observes one root [`CancellationToken`]; `stop()` cancels it,
//! waits for the tasks within `shutdown_timeout` and then releases every
//! lease still owned by this host.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use backon::Retryable;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::balancer::select_leases_to_acquire;
use super::discovery::PartitionDiscoverer;
use super::dispatcher::{ChangeHandler, Dispatcher};
use super::feed_reader::FeedReader;
use super::lease_manager::LeaseManager;
use super::supervisor::{WorkerExit, WorkerRegistry};
use super::worker::PartitionWorker;
use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry::{record_retry_attempt, startup_policy};
use crate::store::{FeedSource, LeaseStore};
use crate::types::PartitionId;

/// Consecutive renewal errors in one pass before the pass is abandoned.
const BULK_FAILURE_THRESHOLD: usize = 3;

/// Adds ±15% jitter so hosts started together do not hit the lease store
/// in lockstep.
fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessorState::Starting,
            2 => ProcessorState::Running,
            3 => ProcessorState::Stopping,
            _ => ProcessorState::Stopped,
        }
    }
}

/// Lease-based change feed processor.
///
/// Cheap to clone; clones share the same lifecycle.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use changefeed::config::ProcessorConfig;
/// use changefeed::error::HandlerError;
/// use changefeed::processor::{ChangeFeedProcessor, handler_fn};
/// use changefeed::store::InMemoryStore;
///
/// # async fn demo() -> changefeed::error::Result<()> {
/// let store = Arc::new(InMemoryStore::new(4));
/// let handler = handler_fn(|batch| async move {
///     tracing::info!("RECEIVED {} RECORDS", batch.len());
///     Ok::<(), HandlerError>(())
/// });
/// let processor = ChangeFeedProcessor::new(
///     ProcessorConfig::default(),
///     store.clone(),
///     store,
///     Arc::new(handler),
/// );
/// processor.run_until(async {
///     let _ = tokio::signal::ctrl_c().await;
/// })
/// .await
/// # }
/// ```
#[derive(Clone)]
pub struct ChangeFeedProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ProcessorConfig>,
    feed: Arc<dyn FeedSource>,
    lease_store: Arc<dyn LeaseStore>,
    handler: Arc<dyn ChangeHandler>,
    leases: Arc<LeaseManager>,
    state: AtomicU8,
    /// `Some` between a successful start and the matching stop.
    lifecycle: Mutex<Option<Runtime>>,
}

/// Resources of one start/stop cycle.
struct Runtime {
    shutdown: CancellationToken,
    context: Arc<ProcessorContext>,
    loops: Vec<JoinHandle<()>>,
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Dropping the last processor handle without stop() must not leave
        // loops and workers running.
        self.shutdown.cancel();
    }
}

impl ChangeFeedProcessor {
    pub fn new(
        config: ProcessorConfig,
        feed: Arc<dyn FeedSource>,
        lease_store: Arc<dyn LeaseStore>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        let config = Arc::new(config);
        let leases = Arc::new(LeaseManager::new(lease_store.clone(), config.clone()));
        Self {
            inner: Arc::new(Inner {
                config,
                feed,
                lease_store,
                handler,
                leases,
                state: AtomicU8::new(ProcessorState::Stopped as u8),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProcessorState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn host_name(&self) -> &str {
        &self.inner.config.host_name
    }

    /// Partitions whose lease this host currently holds.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        self.inner.leases.owned_partitions()
    }

    /// Start processing.
    ///
    /// Returns once both stores answered, the first acquisition round ran
    /// and the background loops are up. Calling `start` on a running
    /// processor is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an invalid configuration
    /// - [`Error::Startup`] when a store stays unreachable for
    ///   `startup_timeout` or the first acquisition round fails
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!(host = %self.host_name(), "Processor already running");
            return Ok(());
        }
        self.inner.config.ensure_valid()?;

        self.set_state(ProcessorState::Starting);
        info!(
            host = %self.host_name(),
            lease_prefix = %self.inner.config.lease_prefix,
            "Starting change feed processor"
        );

        match self.launch().await {
            Ok(runtime) => {
                *lifecycle = Some(runtime);
                self.set_state(ProcessorState::Running);
                info!(
                    host = %self.host_name(),
                    owned = self.inner.leases.owned_count(),
                    "Change feed processor started"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ProcessorState::Stopped);
                error!(host = %self.host_name(), error = %e, "Change feed processor failed to start");
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Runtime> {
        let startup_timeout = self.inner.config.startup_timeout;
        match tokio::time::timeout(startup_timeout, self.probe_stores()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Startup(format!("store probe failed: {}", e))),
            Err(_) => {
                return Err(Error::Startup(format!(
                    "stores not reachable within {:?}",
                    startup_timeout
                )));
            }
        }

        let shutdown = CancellationToken::new();
        let context = Arc::new(ProcessorContext::new(&self.inner, shutdown.child_token()));

        if let Err(e) = context.acquisition_pass().await {
            shutdown.cancel();
            context.workers.lock().await.shutdown_with_timeout(self.inner.config.shutdown_timeout).await;
            self.inner.leases.release_all().await;
            return Err(Error::Startup(format!("initial lease acquisition failed: {}", e)));
        }

        let loops = vec![
            spawn_renewal_loop(context.clone(), shutdown.clone()),
            spawn_acquisition_loop(context.clone(), shutdown.clone()),
        ];

        Ok(Runtime {
            shutdown,
            context,
            loops,
        })
    }

    /// Ping both stores, retrying transient failures until they answer.
    async fn probe_stores(&self) -> Result<()> {
        let inner = &self.inner;
        let mut attempts: u32 = 0;
        let result = (|| {
            attempts += 1;
            async move {
                inner.lease_store.ping().await?;
                inner.feed.ping().await
            }
        })
        .retry(startup_policy())
        .when(Error::is_retriable)
        .notify(|e, delay| {
            warn!(error = %e, retry_in = ?delay, "Store not reachable yet");
        })
        .await;

        if attempts > 1 {
            record_retry_attempt("startup", attempts - 1);
        }
        result
    }

    /// Stop processing and release every lease this host owns.
    ///
    /// In-flight batches finish and are checkpointed if they do so within
    /// `shutdown_timeout`; workers still running after that are aborted and
    /// their partitions are redelivered from the last checkpoint. Calling
    /// `stop` on a stopped processor is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(mut runtime) = lifecycle.take() else {
            debug!(host = %self.host_name(), "Processor not running");
            return Ok(());
        };

        self.set_state(ProcessorState::Stopping);
        info!(host = %self.host_name(), "Stopping change feed processor");

        let timeout = self.inner.config.shutdown_timeout;
        runtime.shutdown.cancel();

        for mut handle in std::mem::take(&mut runtime.loops) {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!("Background loop did not stop in time, aborting");
                handle.abort();
            }
        }

        runtime
            .context
            .workers
            .lock()
            .await
            .shutdown_with_timeout(timeout)
            .await;

        let failures = self.inner.leases.release_all().await;
        metrics::set_owned_partitions(self.inner.leases.owned_count());
        if failures > 0 {
            warn!(failures, "Some leases could not be released and will expire instead");
        }

        self.set_state(ProcessorState::Stopped);
        info!(host = %self.host_name(), "Change feed processor stopped");
        Ok(())
    }

    /// Start, wait for `shutdown` to resolve, then stop.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        info!(host = %self.host_name(), "Shutdown requested");
        self.stop().await
    }
}

/// State shared by the background loops of one run.
struct ProcessorContext {
    config: Arc<ProcessorConfig>,
    feed: Arc<dyn FeedSource>,
    leases: Arc<LeaseManager>,
    discoverer: PartitionDiscoverer,
    dispatcher: Arc<Dispatcher>,
    workers: Mutex<WorkerRegistry>,
    /// Partitions whose handler gave up; not acquired again in this run.
    quarantined: DashSet<PartitionId>,
    /// Earliest restart time of workers that failed to read the feed.
    restart_after: DashMap<PartitionId, Instant>,
}

impl ProcessorContext {
    fn new(inner: &Inner, workers_root: CancellationToken) -> Self {
        Self {
            config: inner.config.clone(),
            feed: inner.feed.clone(),
            leases: inner.leases.clone(),
            discoverer: PartitionDiscoverer::new(
                inner.feed.clone(),
                inner.lease_store.clone(),
                inner.config.clone(),
            ),
            dispatcher: Arc::new(Dispatcher::new(
                inner.handler.clone(),
                inner.leases.clone(),
                inner.config.handler_max_retries,
            )),
            workers: Mutex::new(WorkerRegistry::new(workers_root)),
            quarantined: DashSet::new(),
            restart_after: DashMap::new(),
        }
    }

    fn host(&self) -> &str {
        &self.config.host_name
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    async fn acquisition_pass(&self) -> Result<()> {
        self.handle_worker_exits().await;

        let leases = self.discoverer.discover().await?;
        let owned: HashSet<PartitionId> = self.leases.owned_partitions().into_iter().collect();
        let excluded: HashSet<PartitionId> =
            self.quarantined.iter().map(|p| p.key().clone()).collect();

        let candidates = select_leases_to_acquire(&leases, self.host(), &owned, &excluded, Utc::now());
        for lease in candidates {
            match self.leases.acquire(&lease).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(partition = %lease.partition_id, "Lease taken by another host");
                }
                Err(e) => {
                    warn!(partition = %lease.partition_id, error = %e, "Failed to acquire lease");
                }
            }
        }

        self.spawn_missing_workers().await;
        metrics::set_owned_partitions(self.leases.owned_count());
        Ok(())
    }

    async fn handle_worker_exits(&self) {
        let exits = self.workers.lock().await.reap_finished().await;
        for (partition, exit) in exits {
            match exit {
                WorkerExit::Stopped => {
                    debug!(partition = %partition, "Worker stopped");
                }
                WorkerExit::LeaseLost => {
                    warn!(partition = %partition, "Worker lost its lease");
                    self.leases.forget(&partition);
                }
                WorkerExit::TransientReadFailure(message) => {
                    let cooldown = self.config.worker_restart_cooldown;
                    warn!(
                        partition = %partition,
                        error = %message,
                        restart_in = ?cooldown,
                        "Worker failed to read the feed"
                    );
                    self.restart_after.insert(partition, Instant::now() + cooldown);
                }
                WorkerExit::HandlerFailure(message) => {
                    error!(
                        partition = %partition,
                        error = %message,
                        "Handler gave up on partition, releasing lease"
                    );
                    self.quarantined.insert(partition.clone());
                    self.release(&partition).await;
                }
                WorkerExit::Failed(message) => {
                    error!(partition = %partition, error = %message, "Worker failed, releasing lease");
                    self.release(&partition).await;
                }
            }
        }
    }

    async fn release(&self, partition: &PartitionId) {
        if let Err(e) = self.leases.release(partition).await {
            warn!(partition = %partition, error = %e, "Failed to release lease, it will expire");
        }
    }

    async fn spawn_missing_workers(&self) {
        let mut workers = self.workers.lock().await;
        let now = Instant::now();

        for partition in self.leases.owned_partitions() {
            if workers.is_running(&partition) {
                continue;
            }
            if let Some(until) = self.restart_after.get(&partition).map(|e| *e.value())
                && now < until
            {
                continue;
            }
            self.restart_after.remove(&partition);

            let worker = PartitionWorker::new(
                FeedReader::new(
                    self.feed.clone(),
                    partition.clone(),
                    self.config.max_item_count,
                    self.config.poll_interval,
                ),
                self.dispatcher.clone(),
                self.leases.clone(),
            );
            if workers.spawn(partition.clone(), move |cancel| worker.run(cancel)) {
                debug!(partition = %partition, "Spawned partition worker");
            }
        }
    }

    // ========================================================================
    // Renewal
    // ========================================================================

    async fn renewal_pass(&self) {
        let mut consecutive_errors: usize = 0;

        for partition in self.leases.owned_partitions() {
            match self.leases.renew(&partition).await {
                Ok(_) => {
                    consecutive_errors = 0;
                }
                Err(e) if e.is_lease_lost() => {
                    warn!(partition = %partition, "Lease lost during renewal, stopping worker");
                    self.relinquish(&partition).await;
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(partition = %partition, error = %e, consecutive_errors, "Failed to renew lease");

                    if let Some(expires_at) = self.leases.local_expiry(&partition).await
                        && expires_at <= Utc::now()
                    {
                        warn!(partition = %partition, "Lease expired without renewal, stopping worker");
                        self.relinquish(&partition).await;
                    }

                    if consecutive_errors >= BULK_FAILURE_THRESHOLD {
                        warn!(consecutive_errors, "Lease store failing, abandoning renewal pass");
                        break;
                    }
                }
            }
        }
    }

    async fn relinquish(&self, partition: &PartitionId) {
        self.leases.forget(partition);
        self.workers.lock().await.cancel(partition);
    }
}

fn spawn_renewal_loop(context: Arc<ProcessorContext>, shutdown: CancellationToken) -> JoinHandle<()> {
    let interval = context.config.lease_renew_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(with_jitter(interval)) => {},
                _ = shutdown.cancelled() => {
                    debug!("Lease renewal loop received shutdown signal");
                    break;
                }
            }
            context.renewal_pass().await;
        }
    })
}

fn spawn_acquisition_loop(context: Arc<ProcessorContext>, shutdown: CancellationToken) -> JoinHandle<()> {
    let interval = context.config.lease_acquire_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(with_jitter(interval)) => {},
                _ = shutdown.cancelled() => {
                    debug!("Lease acquisition loop received shutdown signal");
                    break;
                }
            }
            if let Err(e) = context.acquisition_pass().await {
                warn!(error = %e, "Lease acquisition pass failed");
            }
        }
    })
}
