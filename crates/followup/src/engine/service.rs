//! Follow-up service: start, halt, audit reads and definition admin

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::executor::{ExecutorError, RunOutcome, StepExecutor};
use crate::clock::Clock;
use crate::definition::{DefinitionError, WorkflowDefinition};
use crate::instance::{ExecutionLogEntry, FollowupInstance, InstanceKey, InstanceState};
use crate::notify::{Directory, DirectoryError};
use crate::persistence::{FollowupStore, InstanceFilter, Pagination, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("recipient not found: {0}")]
    RecipientNotFound(Uuid),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] DefinitionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Whether `start` created a new instance or reset an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Created,
    Restarted,
}

#[derive(Debug)]
pub struct StartResult {
    /// Instance as stored after `start`, including any immediate run
    pub instance: FollowupInstance,
    pub outcome: StartOutcome,

    /// Immediate run for a zero-delay first step
    ///
    /// `None` when the first step was not due yet. A failed run leaves the
    /// instance pending for the scanner; the error is reported here.
    pub immediate_run: Option<Result<RunOutcome, ExecutorError>>,
}

impl StartResult {
    pub fn immediate_outcome(&self) -> Option<&RunOutcome> {
        self.immediate_run.as_ref().and_then(|run| run.as_ref().ok())
    }

    pub fn immediate_error(&self) -> Option<&ExecutorError> {
        self.immediate_run.as_ref().and_then(|run| run.as_ref().err())
    }
}

pub struct FollowupService {
    store: Arc<dyn FollowupStore>,
    directory: Arc<dyn Directory>,
    executor: Arc<StepExecutor>,
    clock: Arc<dyn Clock>,
}

impl FollowupService {
    pub fn new(
        store: Arc<dyn FollowupStore>,
        directory: Arc<dyn Directory>,
        executor: Arc<StepExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            executor,
            clock,
        }
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    /// Start a workflow for a recipient, or restart it from the beginning
    ///
    /// Restarting keeps the instance id and its log history. When the first
    /// active step has no delay it runs before this returns; if that run
    /// fails the instance stays due and the scanner retries it.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        tenant_id: Uuid,
        recipient_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<StartResult, ServiceError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .filter(|w| w.tenant_id == tenant_id)
            .ok_or(ServiceError::WorkflowNotFound(workflow_id))?;

        self.directory
            .recipient(tenant_id, recipient_id)
            .await?
            .ok_or(ServiceError::RecipientNotFound(recipient_id))?;

        let now = self.clock.now();
        let key = InstanceKey {
            tenant_id,
            recipient_id,
            workflow_id,
        };

        let (state, log, run_now) = match workflow.first_active_step() {
            None => (
                InstanceState::Completed { completed_at: now },
                Some(ExecutionLogEntry::workflow_completed(Uuid::nil(), now)),
                false,
            ),
            Some(first) if first.delay.is_zero() => (
                InstanceState::InProgress {
                    current_step: None,
                    next_run_at: Some(now),
                },
                None,
                true,
            ),
            Some(first) => (
                InstanceState::Pending {
                    next_run_at: first.due_from(now),
                },
                None,
                false,
            ),
        };

        let upserted = self
            .store
            .upsert_instance(FollowupInstance::new(key, state, now), log)
            .await?;

        let outcome = if upserted.created {
            StartOutcome::Created
        } else {
            StartOutcome::Restarted
        };
        let instance_id = upserted.instance.id;

        info!(
            %instance_id,
            ?outcome,
            status = %upserted.instance.status(),
            "follow-up started"
        );

        if !run_now {
            return Ok(StartResult {
                instance: upserted.instance,
                outcome,
                immediate_run: None,
            });
        }

        let immediate_run = self.executor.run(instance_id).await;
        if let Err(e) = &immediate_run {
            warn!(%instance_id, error = %e, "immediate run failed, leaving it to the scanner");
        }

        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(ServiceError::InstanceNotFound(instance_id))?;

        Ok(StartResult {
            instance,
            outcome,
            immediate_run: Some(immediate_run),
        })
    }

    /// Halt an instance, keeping its current step and log
    ///
    /// Halting a completed or already halted instance changes nothing.
    #[instrument(skip(self))]
    pub async fn halt(&self, instance_id: Uuid) -> Result<FollowupInstance, ServiceError> {
        loop {
            let instance = self.get_instance(instance_id).await?;
            if instance.state.is_terminal() {
                return Ok(instance);
            }

            let mut halted = instance.clone();
            halted.state = instance.state.halt(self.clock.now());

            match self.store.update_instance(&halted, instance.version).await {
                Ok(stored) => {
                    info!(%instance_id, "follow-up halted");
                    return Ok(stored);
                }
                // A step ran in between; reload and halt the newer state
                Err(StoreError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<FollowupInstance, ServiceError> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or(ServiceError::InstanceNotFound(instance_id))
    }

    pub async fn list_instances(
        &self,
        tenant_id: Uuid,
        filter: &InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<FollowupInstance>, ServiceError> {
        Ok(self
            .store
            .list_instances(tenant_id, filter, pagination)
            .await?)
    }

    /// Execution log of an instance, oldest first
    pub async fn execution_log(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, ServiceError> {
        self.get_instance(instance_id).await?;
        Ok(self.store.execution_log(instance_id).await?)
    }

    // =========================================================================
    // Definition admin
    // =========================================================================

    pub async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), ServiceError> {
        workflow.validate()?;
        self.store.save_workflow(workflow).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "workflow saved");
        Ok(())
    }

    pub async fn get_workflow(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<WorkflowDefinition, ServiceError> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .filter(|w| w.tenant_id == tenant_id)
            .ok_or(ServiceError::WorkflowNotFound(workflow_id))
    }

    /// Deactivating a workflow completes its in-flight instances on their
    /// next run
    pub async fn set_workflow_active(
        &self,
        workflow_id: Uuid,
        active: bool,
    ) -> Result<(), ServiceError> {
        match self.store.set_workflow_active(workflow_id, active).await {
            Err(StoreError::WorkflowNotFound(id)) => Err(ServiceError::WorkflowNotFound(id)),
            other => Ok(other?),
        }
    }

    pub async fn set_step_active(&self, step_id: Uuid, active: bool) -> Result<(), ServiceError> {
        Ok(self.store.set_step_active(step_id, active).await?)
    }
}
