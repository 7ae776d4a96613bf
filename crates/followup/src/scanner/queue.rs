//! Job queue seam between the scanner and the executor

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

/// Accepts instance ids to be run by an executor
///
/// Delivery is at-least-once; the executor tolerates duplicates.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, instance_id: Uuid) -> Result<(), QueueError>;
}

/// Bounded tokio channel queue
///
/// `enqueue` waits while the channel is full.
#[derive(Clone)]
pub struct ChannelJobQueue {
    sender: mpsc::Sender<Uuid>,
}

impl ChannelJobQueue {
    /// Create a queue and the receiver its consumer reads from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, instance_id: Uuid) -> Result<(), QueueError> {
        self.sender
            .send(instance_id)
            .await
            .map_err(|_| QueueError::Closed)
    }
}
