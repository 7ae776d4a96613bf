//! Due-instance scanner

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::queue::{JobQueue, QueueError};
use crate::clock::Clock;
use crate::persistence::{FollowupStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum instances enqueued per scan
    pub batch_size: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

impl ScannerConfig {
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Finds due instances and hands them to a [`JobQueue`]
///
/// Read-only: the executor decides whether each job still has work to do.
pub struct DueScanner {
    store: Arc<dyn FollowupStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: ScannerConfig,
}

impl DueScanner {
    pub fn new(
        store: Arc<dyn FollowupStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            config,
        }
    }

    /// Enqueue up to one batch of due instances, optionally for one tenant
    ///
    /// Returns how many were enqueued.
    #[instrument(skip(self))]
    pub async fn scan_due(&self, tenant_id: Option<Uuid>) -> Result<usize, ScanError> {
        let now = self.clock.now();
        let due = self
            .store
            .due_instances(tenant_id, now, self.config.batch_size)
            .await?;

        for instance_id in &due {
            self.queue.enqueue(*instance_id).await?;
        }

        if !due.is_empty() {
            debug!(count = due.len(), "enqueued due follow-ups");
        }
        Ok(due.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::instance::{FollowupInstance, InstanceKey, InstanceState};
    use crate::persistence::InMemoryFollowupStore;
    use crate::scanner::ChannelJobQueue;
    use chrono::Utc;

    #[tokio::test]
    async fn test_scan_respects_batch_size() {
        let store = Arc::new(InMemoryFollowupStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tenant = Uuid::now_v7();

        for _ in 0..3 {
            let instance = FollowupInstance::new(
                InstanceKey {
                    tenant_id: tenant,
                    recipient_id: Uuid::now_v7(),
                    workflow_id: Uuid::now_v7(),
                },
                InstanceState::Pending {
                    next_run_at: clock.now(),
                },
                clock.now(),
            );
            store.upsert_instance(instance, None).await.unwrap();
        }

        let (queue, mut receiver) = ChannelJobQueue::channel(10);
        let scanner = DueScanner::new(
            store,
            Arc::new(queue),
            clock,
            ScannerConfig::default().with_batch_size(2),
        );

        assert_eq!(scanner.scan_due(Some(tenant)).await.unwrap(), 2);
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());

        assert_eq!(scanner.scan_due(Some(Uuid::now_v7())).await.unwrap(), 0);
    }
}
