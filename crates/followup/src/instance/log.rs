//! Append-only execution log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{Channel, Step};

pub const WORKFLOW_COMPLETED_NOTE: &str = "workflow completed";
pub const NO_DELIVERY_NOTE: &str = "no delivery action required";
pub const NO_STAFF_RECIPIENT_NOTE: &str = "no staff recipient could be resolved";
pub const NOTIFICATIONS_DISABLED_NOTE: &str = "notification delivery is disabled";

/// Outcome recorded for one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Queued,
    Sent,
    Skipped,
    Failed,
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Sent => write!(f, "sent"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown log status: {}", other)),
        }
    }
}

/// Audit record of one step dispatch attempt
///
/// Entries are built in memory, finalised (sent/skipped/failed) inside the
/// step unit, and persisted once. Stores never update or delete them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: Uuid,
    pub instance_id: Uuid,

    /// `None` for system entries such as workflow completion
    pub step_id: Option<Uuid>,

    pub status: LogStatus,
    pub channel: Option<Channel>,
    pub run_at: DateTime<Utc>,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
}

impl ExecutionLogEntry {
    /// Entry for a step about to be dispatched
    pub fn queued(instance_id: Uuid, step: &Step, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: Some(step.id),
            status: LogStatus::Queued,
            channel: Some(step.channel.clone()),
            run_at,
            note: None,
            metadata: serde_json::json!({ "sequence": step.sequence }),
        }
    }

    /// Terminal system entry written when the sequence is exhausted
    pub fn workflow_completed(instance_id: Uuid, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: None,
            status: LogStatus::Skipped,
            channel: None,
            run_at,
            note: Some(WORKFLOW_COMPLETED_NOTE.to_string()),
            metadata: serde_json::json!({}),
        }
    }

    pub fn mark_sent(&mut self, delivery_id: &str) {
        self.status = LogStatus::Sent;
        self.set_metadata("delivery_id", serde_json::Value::String(delivery_id.to_string()));
    }

    pub fn mark_skipped(&mut self, note: impl Into<String>) {
        self.status = LogStatus::Skipped;
        self.note = Some(note.into());
    }

    pub fn mark_failed(&mut self, note: impl Into<String>) {
        self.status = LogStatus::Failed;
        self.note = Some(note.into());
    }

    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.metadata.get("delivery_id").and_then(|v| v.as_str())
    }
}
