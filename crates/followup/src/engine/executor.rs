//! Step executor
//!
//! The `StepExecutor` advances one instance by at most one step per run:
//! - Terminal and not-yet-due instances are left alone
//! - The pure planner decides the next state and log entry
//! - Directory lookups resolve the dispatch before any step unit opens
//! - The instance update, delivery and log append form one step unit
//!
//! The compare-and-set on the loaded version is the point of mutual
//! exclusion. A run that loses the race reports
//! [`RunOutcome::AlreadyHandled`] and writes nothing.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::planner::{build_payload, DispatchIntent, StepPlanner};
use crate::clock::Clock;
use crate::definition::Step;
use crate::instance::{
    ExecutionLogEntry, FollowupInstance, InstanceStatus, LogStatus, NOTIFICATIONS_DISABLED_NOTE,
    NO_STAFF_RECIPIENT_NOTE,
};
use crate::notify::{
    Directory, DirectoryError, DispatchRequest, GatewayError, NotificationGateway,
};
use crate::persistence::{FollowupStore, StoreError};

/// Errors from executor runs
///
/// Any error leaves the instance and its log exactly as they were before the
/// run; the next scan retries it.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] GatewayError),
}

/// Result of one executor run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A step ran and was logged with `status`
    Advanced { step_id: Uuid, status: LogStatus },

    /// The sequence was exhausted and the instance completed
    Completed,

    /// The instance was already completed or halted
    Terminal(InstanceStatus),

    /// The next step is not due yet
    NotDue,

    /// Another run changed the instance first
    AlreadyHandled,
}

pub struct StepExecutor {
    store: Arc<dyn FollowupStore>,
    directory: Arc<dyn Directory>,
    gateway: Arc<dyn NotificationGateway>,
    clock: Arc<dyn Clock>,
    planner: StepPlanner,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn FollowupStore>,
        directory: Arc<dyn Directory>,
        gateway: Arc<dyn NotificationGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            directory,
            gateway,
            clock,
            planner: StepPlanner::default(),
        }
    }

    pub fn with_planner(mut self, planner: StepPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Run the next due step of an instance
    #[instrument(skip(self))]
    pub async fn run(&self, instance_id: Uuid) -> Result<RunOutcome, ExecutorError> {
        let now = self.clock.now();

        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(ExecutorError::InstanceNotFound(instance_id))?;

        if instance.state.is_terminal() {
            debug!(status = %instance.status(), "instance is terminal, nothing to run");
            return Ok(RunOutcome::Terminal(instance.status()));
        }

        if !instance.state.is_due(now) {
            debug!(next_run_at = ?instance.state.next_run_at(), "instance not due yet");
            return Ok(RunOutcome::NotDue);
        }

        let workflow = self.store.get_workflow(instance.workflow_id).await?;
        let plan = self.planner.plan(&instance, workflow.as_ref(), now);
        let completes = plan.completes();

        // Directory reads happen before the step unit so it holds one
        // connection at most
        let mut log = plan.log;
        let request = self.resolve(&instance, plan.dispatch, &mut log).await?;

        let mut tx = self.store.begin_step().await?;

        match tx.update_instance(&plan.instance, instance.version).await {
            Ok(_) => {}
            Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                debug!(expected, actual, "instance changed concurrently, run already handled");
                return Ok(RunOutcome::AlreadyHandled);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(request) = request {
            // Returning early drops `tx`, which rolls the unit back
            self.deliver(request, &mut log).await?;
        }

        tx.append_log(&log).await?;
        tx.commit().await?;

        if completes {
            info!(workflow_id = %instance.workflow_id, "follow-up completed");
            return Ok(RunOutcome::Completed);
        }

        let step_id = log.step_id.unwrap_or_default();
        info!(%step_id, status = %log.status, "follow-up step ran");
        Ok(RunOutcome::Advanced {
            step_id,
            status: log.status,
        })
    }

    /// Turn a dispatch intent into a gateway request
    ///
    /// Returns `None` when nothing is to be sent; the log entry then carries
    /// the reason.
    async fn resolve(
        &self,
        instance: &FollowupInstance,
        intent: DispatchIntent,
        log: &mut ExecutionLogEntry,
    ) -> Result<Option<DispatchRequest>, ExecutorError> {
        match intent {
            DispatchIntent::None => Ok(None),
            DispatchIntent::Staff {
                step,
                address,
                role,
            } => {
                let address = match address {
                    Some(address) => Some(address),
                    None => {
                        self.directory
                            .staff_address_for_role(instance.tenant_id, &role)
                            .await?
                    }
                };

                let Some(address) = address else {
                    warn!(%role, "no staff recipient for follow-up step");
                    log.mark_skipped(NO_STAFF_RECIPIENT_NOTE);
                    return Ok(None);
                };

                let recipient = self
                    .directory
                    .recipient(instance.tenant_id, instance.recipient_id)
                    .await?;
                let payload = build_payload(&step, recipient.as_ref(), None);
                Ok(Some(request_for(instance, &step, address, payload)))
            }
            DispatchIntent::Member { step } => {
                let recipient = self
                    .directory
                    .recipient(instance.tenant_id, instance.recipient_id)
                    .await?;

                let Some(contact) = recipient.as_ref().and_then(|r| r.contact_for(&step.channel))
                else {
                    warn!(channel = %step.channel, "recipient has no contact for channel");
                    log.mark_skipped(format!("recipient has no {} contact", step.channel));
                    return Ok(None);
                };

                let template = match step.template_id {
                    Some(template_id) => {
                        match self
                            .directory
                            .template(instance.tenant_id, template_id)
                            .await?
                        {
                            Some(template) => Some(template),
                            None => {
                                warn!(%template_id, "template not found");
                                log.mark_skipped(format!("template {} not found", template_id));
                                return Ok(None);
                            }
                        }
                    }
                    None => None,
                };

                let payload = build_payload(&step, recipient.as_ref(), template.as_ref());
                Ok(Some(request_for(instance, &step, contact, payload)))
            }
        }
    }

    async fn deliver(
        &self,
        request: DispatchRequest,
        log: &mut ExecutionLogEntry,
    ) -> Result<(), ExecutorError> {
        let channel = request.channel.clone();

        match self.gateway.queue(request).await {
            Ok(delivery_id) => {
                debug!(%delivery_id, %channel, "notification queued");
                log.mark_sent(delivery_id.as_str());
                Ok(())
            }
            Err(GatewayError::Rejected(reason)) => {
                warn!(%reason, %channel, "notification rejected");
                log.mark_failed(reason);
                Ok(())
            }
            Err(GatewayError::Disabled) => {
                debug!(%channel, "notification delivery disabled");
                log.mark_skipped(NOTIFICATIONS_DISABLED_NOTE);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, %channel, "notification dispatch failed");
                Err(e.into())
            }
        }
    }
}

fn request_for(
    instance: &FollowupInstance,
    step: &Step,
    address: String,
    payload: serde_json::Value,
) -> DispatchRequest {
    DispatchRequest {
        tenant_id: instance.tenant_id,
        instance_id: instance.id,
        step_id: step.id,
        recipient_id: instance.recipient_id,
        channel: step.channel.clone(),
        address,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::definition::{Channel, WorkflowDefinition};
    use crate::engine::planner::DEFAULT_STAFF_ROLE;
    use crate::instance::{InstanceKey, InstanceState};
    use crate::notify::{
        LogOnlyGateway, MessageTemplate, Recipient, RecordingGateway, StaticDirectory,
    };
    use crate::persistence::InMemoryFollowupStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts lookups made while the store has a step unit open
    struct WatchedDirectory {
        inner: StaticDirectory,
        store: Arc<InMemoryFollowupStore>,
        lookups_inside_step: AtomicUsize,
    }

    impl WatchedDirectory {
        fn observe(&self) {
            if self.store.open_step_units() > 0 {
                self.lookups_inside_step.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl Directory for WatchedDirectory {
        async fn recipient(
            &self,
            tenant_id: Uuid,
            recipient_id: Uuid,
        ) -> Result<Option<Recipient>, DirectoryError> {
            self.observe();
            self.inner.recipient(tenant_id, recipient_id).await
        }

        async fn staff_address_for_role(
            &self,
            tenant_id: Uuid,
            role: &str,
        ) -> Result<Option<String>, DirectoryError> {
            self.observe();
            self.inner.staff_address_for_role(tenant_id, role).await
        }

        async fn template(
            &self,
            tenant_id: Uuid,
            template_id: Uuid,
        ) -> Result<Option<MessageTemplate>, DirectoryError> {
            self.observe();
            self.inner.template(tenant_id, template_id).await
        }
    }

    struct Harness {
        store: Arc<InMemoryFollowupStore>,
        directory: Arc<StaticDirectory>,
        gateway: Arc<RecordingGateway>,
        executor: StepExecutor,
        instance: FollowupInstance,
    }

    async fn harness(workflow: WorkflowDefinition, recipient: Recipient) -> Harness {
        let store = Arc::new(InMemoryFollowupStore::new());
        let directory = Arc::new(StaticDirectory::new());
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        store.save_workflow(&workflow).await.unwrap();
        let instance = FollowupInstance::new(
            InstanceKey {
                tenant_id: workflow.tenant_id,
                recipient_id: recipient.id,
                workflow_id: workflow.id,
            },
            InstanceState::Pending {
                next_run_at: clock.now(),
            },
            clock.now(),
        );
        directory.add_recipient(recipient);
        let instance = store.upsert_instance(instance, None).await.unwrap().instance;

        let executor = StepExecutor::new(store.clone(), directory.clone(), gateway.clone(), clock);
        Harness {
            store,
            directory,
            gateway,
            executor,
            instance,
        }
    }

    #[tokio::test]
    async fn test_member_step_without_contact_is_skipped() {
        let tenant = Uuid::now_v7();
        let workflow = WorkflowDefinition::new(tenant, "Visitors")
            .with_step(Step::new(1, Duration::ZERO, Channel::Sms));
        let h = harness(workflow, Recipient::new(tenant, "Ada", "Lovelace")).await;

        let outcome = h.executor.run(h.instance.id).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Advanced {
                status: LogStatus::Skipped,
                ..
            }
        ));

        let log = h.store.execution_log(h.instance.id).await.unwrap();
        assert_eq!(log[0].note.as_deref(), Some("recipient has no sms contact"));
        assert_eq!(h.gateway.count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_template_is_skipped() {
        let tenant = Uuid::now_v7();
        let template_id = Uuid::now_v7();
        let workflow = WorkflowDefinition::new(tenant, "Visitors").with_step(
            Step::new(1, Duration::ZERO, Channel::Email).with_template(template_id),
        );
        let recipient = Recipient::new(tenant, "Ada", "Lovelace").with_email("ada@example.com");
        let h = harness(workflow, recipient).await;

        h.executor.run(h.instance.id).await.unwrap();
        let log = h.store.execution_log(h.instance.id).await.unwrap();
        assert_eq!(log[0].status, LogStatus::Skipped);
        assert_eq!(
            log[0].note.as_deref(),
            Some(format!("template {} not found", template_id).as_str())
        );
    }

    #[tokio::test]
    async fn test_staff_step_without_address_is_skipped() {
        let tenant = Uuid::now_v7();
        let workflow = WorkflowDefinition::new(tenant, "Visitors")
            .with_step(Step::new(1, Duration::ZERO, Channel::StaffNotification));
        let h = harness(workflow, Recipient::new(tenant, "Ada", "Lovelace")).await;

        h.executor.run(h.instance.id).await.unwrap();
        let log = h.store.execution_log(h.instance.id).await.unwrap();
        assert_eq!(log[0].note.as_deref(), Some(NO_STAFF_RECIPIENT_NOTE));
    }

    #[tokio::test]
    async fn test_rejected_notification_is_logged_as_failed_and_advances() {
        let tenant = Uuid::now_v7();
        let workflow = WorkflowDefinition::new(tenant, "Visitors")
            .with_step(Step::new(1, Duration::ZERO, Channel::Email))
            .with_step(Step::new(2, Duration::from_secs(60), Channel::Email));
        let recipient = Recipient::new(tenant, "Ada", "Lovelace").with_email("not-an-address");
        let h = harness(workflow, recipient).await;
        h.gateway
            .fail_with(GatewayError::Rejected("invalid address".to_string()));

        let outcome = h.executor.run(h.instance.id).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Advanced {
                status: LogStatus::Failed,
                ..
            }
        ));

        let instance = h.store.get_instance(h.instance.id).await.unwrap().unwrap();
        assert_eq!(instance.status(), InstanceStatus::InProgress);
        assert_eq!(instance.version, h.instance.version + 1);
    }

    #[tokio::test]
    async fn test_unavailable_gateway_rolls_back() {
        let tenant = Uuid::now_v7();
        let workflow = WorkflowDefinition::new(tenant, "Visitors")
            .with_step(Step::new(1, Duration::ZERO, Channel::Email));
        let recipient = Recipient::new(tenant, "Ada", "Lovelace").with_email("ada@example.com");
        let h = harness(workflow, recipient).await;
        h.gateway
            .fail_with(GatewayError::Unavailable("timeout".to_string()));

        let result = h.executor.run(h.instance.id).await;
        assert!(matches!(result, Err(ExecutorError::Dispatch(_))));

        let instance = h.store.get_instance(h.instance.id).await.unwrap().unwrap();
        assert_eq!(instance, h.instance);
        assert!(h.store.execution_log(h.instance.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_lookups_happen_outside_the_step_unit() {
        let tenant = Uuid::now_v7();
        let template = MessageTemplate {
            id: Uuid::now_v7(),
            tenant_id: tenant,
            name: "Welcome".to_string(),
            subject: Some("Welcome".to_string()),
            body: "Hello".to_string(),
        };
        let workflow = WorkflowDefinition::new(tenant, "Visitors")
            .with_step(Step::new(1, Duration::ZERO, Channel::Email).with_template(template.id))
            .with_step(Step::new(2, Duration::ZERO, Channel::StaffNotification));
        let recipient = Recipient::new(tenant, "Ada", "Lovelace").with_email("ada@example.com");

        let store = Arc::new(InMemoryFollowupStore::new());
        let inner = StaticDirectory::new();
        inner.add_template(template);
        inner.add_staff(tenant, DEFAULT_STAFF_ROLE, "coordinator@example.com");
        let directory = Arc::new(WatchedDirectory {
            inner,
            store: store.clone(),
            lookups_inside_step: AtomicUsize::new(0),
        });
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        store.save_workflow(&workflow).await.unwrap();
        directory.inner.add_recipient(recipient.clone());
        let instance = FollowupInstance::new(
            InstanceKey {
                tenant_id: tenant,
                recipient_id: recipient.id,
                workflow_id: workflow.id,
            },
            InstanceState::Pending {
                next_run_at: clock.now(),
            },
            clock.now(),
        );
        let instance = store.upsert_instance(instance, None).await.unwrap().instance;
        let executor = StepExecutor::new(store.clone(), directory.clone(), gateway.clone(), clock);

        executor.run(instance.id).await.unwrap();
        executor.run(instance.id).await.unwrap();

        assert_eq!(gateway.count(), 2);
        assert_eq!(directory.lookups_inside_step.load(Ordering::SeqCst), 0);
        assert_eq!(store.open_step_units(), 0);
    }

    #[tokio::test]
    async fn test_disabled_gateway_skips_and_advances() {
        let tenant = Uuid::now_v7();
        let workflow = WorkflowDefinition::new(tenant, "Visitors")
            .with_step(Step::new(1, Duration::ZERO, Channel::Email))
            .with_step(Step::new(2, Duration::from_secs(60), Channel::Email));
        let recipient = Recipient::new(tenant, "Ada", "Lovelace").with_email("ada@example.com");
        let h = harness(workflow, recipient).await;
        let executor = StepExecutor::new(
            h.store.clone(),
            h.directory.clone(),
            Arc::new(LogOnlyGateway),
            Arc::new(ManualClock::new(Utc::now())),
        );

        let outcome = executor.run(h.instance.id).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Advanced {
                status: LogStatus::Skipped,
                ..
            }
        ));

        let log = h.store.execution_log(h.instance.id).await.unwrap();
        assert_eq!(log[0].note.as_deref(), Some(NOTIFICATIONS_DISABLED_NOTE));
        let instance = h.store.get_instance(h.instance.id).await.unwrap().unwrap();
        assert_eq!(instance.status(), InstanceStatus::InProgress);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_an_error() {
        let tenant = Uuid::now_v7();
        let workflow = WorkflowDefinition::new(tenant, "Visitors");
        let h = harness(workflow, Recipient::new(tenant, "Ada", "Lovelace")).await;

        let result = h.executor.run(Uuid::now_v7()).await;
        assert!(matches!(result, Err(ExecutorError::InstanceNotFound(_))));
    }
}
