//! Dispatcher runtime
//!
//! Runs two loops until shutdown:
//! - a scan loop that enqueues due instances every `scan_interval`
//! - a consumer that runs the executor for each job, at most
//!   `max_concurrency` at a time
//!
//! On shutdown both loops stop and in-flight runs are given
//! `shutdown_timeout` to finish.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::due::{DueScanner, ScannerConfig};
use super::queue::ChannelJobQueue;
use crate::clock::Clock;
use crate::engine::{RunOutcome, StepExecutor};
use crate::persistence::FollowupStore;

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Time between scans
    #[serde(with = "duration_millis")]
    pub scan_interval: Duration,

    /// Restrict scans to one tenant
    pub tenant_id: Option<Uuid>,

    /// Maximum concurrent executor runs
    pub max_concurrency: usize,

    /// Capacity of the job channel between scanner and consumer
    pub queue_capacity: usize,

    /// Scanner configuration
    pub scanner: ScannerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            tenant_id: None,
            max_concurrency: 10,
            queue_capacity: 1000,
            scanner: ScannerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_scanner(mut self, config: ScannerConfig) -> Self {
        self.scanner = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("graceful shutdown timed out with {0} runs in flight")]
    ShutdownTimeout(usize),
}

/// Scan loop plus bounded executor consumer
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(Dispatcher::new(store, executor, clock, DispatcherConfig::default()));
///
/// let runner = dispatcher.clone();
/// let handle = tokio::spawn(async move { runner.run().await });
///
/// // ... later
/// dispatcher.shutdown();
/// handle.await??;
/// ```
pub struct Dispatcher {
    store: Arc<dyn FollowupStore>,
    executor: Arc<StepExecutor>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn FollowupStore>,
        executor: Arc<StepExecutor>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            executor,
            clock,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Signal both loops to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until [`Dispatcher::shutdown`] is called
    pub async fn run(&self) -> Result<(), DispatcherError> {
        info!(
            scan_interval_ms = self.config.scan_interval.as_millis() as u64,
            max_concurrency = self.config.max_concurrency,
            tenant_id = ?self.config.tenant_id,
            "Starting follow-up dispatcher"
        );

        let (queue, receiver) = ChannelJobQueue::channel(self.config.queue_capacity);
        let scanner = DueScanner::new(
            self.store.clone(),
            Arc::new(queue),
            self.clock.clone(),
            self.config.scanner.clone(),
        );
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));

        tokio::join!(
            self.scan_loop(scanner),
            self.consume_loop(receiver, permits.clone())
        );

        self.drain(permits).await?;
        info!("Follow-up dispatcher stopped");
        Ok(())
    }

    async fn scan_loop(&self, scanner: DueScanner) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.config.scan_interval);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match scanner.scan_due(self.config.tenant_id).await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "scan enqueued due follow-ups"),
                        Err(e) => error!("Due scan failed: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Scan loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("Scan loop exited");
    }

    async fn consume_loop(&self, mut receiver: mpsc::Receiver<Uuid>, permits: Arc<Semaphore>) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let instance_id = tokio::select! {
                job = receiver.recv() => match job {
                    Some(instance_id) => instance_id,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    debug!("Consumer: shutdown requested");
                    break;
                }
            };

            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let executor = self.executor.clone();
            tokio::spawn(async move {
                match executor.run(instance_id).await {
                    Ok(RunOutcome::AlreadyHandled) => {
                        debug!(%instance_id, "follow-up job already handled");
                    }
                    Ok(outcome) => debug!(%instance_id, ?outcome, "follow-up job done"),
                    Err(e) => warn!(%instance_id, error = %e, "follow-up job failed"),
                }
                drop(permit);
            });
        }

        debug!("Consumer exited");
    }

    async fn drain(&self, permits: Arc<Semaphore>) -> Result<(), DispatcherError> {
        let max = self.config.max_concurrency;
        let all = u32::try_from(max).unwrap_or(u32::MAX);

        match tokio::time::timeout(self.config.shutdown_timeout, permits.acquire_many(all)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                let remaining = max - permits.available_permits();
                warn!(remaining, "Shutdown timeout reached");
                Err(DispatcherError::ShutdownTimeout(remaining))
            }
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
