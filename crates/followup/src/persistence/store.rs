//! FollowupStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::definition::{DefinitionError, WorkflowDefinition};
use crate::instance::{
    ExecutionLogEntry, FollowupInstance, InstanceKey, InstanceStatus, InvalidState,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected version {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),

    #[error(transparent)]
    InvalidState(#[from] InvalidState),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Filter for listing instances within a tenant
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub workflow_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
}

impl InstanceFilter {
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_recipient(mut self, recipient_id: Uuid) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    pub fn matches(&self, instance: &FollowupInstance) -> bool {
        self.status.map_or(true, |s| instance.status() == s)
            && self.workflow_id.map_or(true, |w| instance.workflow_id == w)
            && self.recipient_id.map_or(true, |r| instance.recipient_id == r)
    }
}

/// Result of an upsert on the natural key
#[derive(Debug, Clone)]
pub struct Upserted {
    pub instance: FollowupInstance,

    /// `false` when an existing instance was reset
    pub created: bool,
}

/// One atomic step unit
///
/// Dropping a transaction without calling [`StepTransaction::commit`] rolls
/// back every write made through it.
#[async_trait]
pub trait StepTransaction: Send {
    /// Write `instance` if the stored version still equals `expected_version`
    ///
    /// Bumps the version on success; returns
    /// [`StoreError::ConcurrencyConflict`] otherwise.
    async fn update_instance(
        &mut self,
        instance: &FollowupInstance,
        expected_version: i64,
    ) -> Result<FollowupInstance, StoreError>;

    async fn append_log(&mut self, entry: &ExecutionLogEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable storage for definitions, instances and the execution log
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait FollowupStore: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Insert or replace a workflow and its steps
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn set_workflow_active(&self, workflow_id: Uuid, active: bool)
        -> Result<(), StoreError>;

    async fn set_step_active(&self, step_id: Uuid, active: bool) -> Result<(), StoreError>;

    // =========================================================================
    // Instances
    // =========================================================================

    async fn get_instance(&self, instance_id: Uuid)
        -> Result<Option<FollowupInstance>, StoreError>;

    async fn find_instance(&self, key: InstanceKey)
        -> Result<Option<FollowupInstance>, StoreError>;

    async fn list_instances(
        &self,
        tenant_id: Uuid,
        filter: &InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<FollowupInstance>, StoreError>;

    /// Create `instance`, or reset the existing one with the same natural key
    ///
    /// A reset keeps the stored id, bumps the version and replaces the state,
    /// `started_at` and `last_step_run_at`. `log`, if given, is appended in
    /// the same unit against the resulting instance id.
    async fn upsert_instance(
        &self,
        instance: FollowupInstance,
        log: Option<ExecutionLogEntry>,
    ) -> Result<Upserted, StoreError>;

    /// Compare-and-set outside a step unit
    async fn update_instance(
        &self,
        instance: &FollowupInstance,
        expected_version: i64,
    ) -> Result<FollowupInstance, StoreError>;

    /// Ids of non-terminal instances due at `now`, nulls first
    ///
    /// In-progress instances without a next run are included: their final
    /// step has run and the completing run is outstanding.
    async fn due_instances(
        &self,
        tenant_id: Option<Uuid>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn begin_step(&self) -> Result<Box<dyn StepTransaction>, StoreError>;

    // =========================================================================
    // Execution log
    // =========================================================================

    /// Entries for an instance in the order they were written
    async fn execution_log(&self, instance_id: Uuid)
        -> Result<Vec<ExecutionLogEntry>, StoreError>;
}
