//! Follow-up instances and their execution log

mod log;
mod state;

pub use log::{
    ExecutionLogEntry, LogStatus, NOTIFICATIONS_DISABLED_NOTE, NO_DELIVERY_NOTE, NO_STAFF_RECIPIENT_NOTE,
    WORKFLOW_COMPLETED_NOTE,
};
pub use state::{InstanceState, InstanceStatus, InvalidState, StateColumns};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Natural key: one instance per recipient per workflow per tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub tenant_id: Uuid,
    pub recipient_id: Uuid,
    pub workflow_id: Uuid,
}

/// One recipient's run of one workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupInstance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub recipient_id: Uuid,
    pub workflow_id: Uuid,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub last_step_run_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,

    /// Optimistic concurrency counter, bumped on every committed mutation
    pub version: i64,
}

impl FollowupInstance {
    pub fn new(key: InstanceKey, state: InstanceState, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id: key.tenant_id,
            recipient_id: key.recipient_id,
            workflow_id: key.workflow_id,
            state,
            started_at,
            last_step_run_at: None,
            metadata: serde_json::json!({}),
            version: 0,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            tenant_id: self.tenant_id,
            recipient_id: self.recipient_id,
            workflow_id: self.workflow_id,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.status()
    }
}
